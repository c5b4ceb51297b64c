//! Traverse CLI - natural-language search over OpenStreetMap tags.
//!
//! # Usage
//!
//! ```bash
//! # One query, results as a JSON array
//! traverse search "restaurant indien"
//!
//! # Console search, one query per line
//! traverse search --format jsonl
//!
//! # Verify corpus, index and models
//! traverse check
//!
//! # View configuration
//! traverse config show
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use traverse_core::{Config, ConfigError, TraverseError};

mod cli;
mod logging;

/// Traverse - natural-language search over OpenStreetMap tags.
#[derive(Parser, Debug)]
#[command(name = "traverse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "TRAVERSE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Search tags for a query, or for each line of stdin
    Search(cli::search::SearchArgs),

    /// Load the corpus and backends and report what was loaded
    Check,

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
        .unwrap_or_else(Config::default_path);

    // Logging isn't initialized yet, so config problems go through eprintln.
    let config = match load_config(&config_path, cli.config.is_some()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(TraverseError::Config(e).exit_code());
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("Traverse v{}", traverse_core::VERSION);

    let result = match cli.command {
        Commands::Search(args) => cli::search::execute(args, config).await,
        Commands::Check => cli::check::execute(config).await,
        Commands::Config(args) => cli::config::execute(args, &config, &config_path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// An explicitly requested file must load. The default location falls back
/// to defaults with a warning.
fn load_config(path: &std::path::Path, explicit: bool) -> Result<Config, ConfigError> {
    if explicit {
        return Config::load_from(path);
    }
    if !path.exists() {
        return Ok(Config::default());
    }
    match Config::load_from(path) {
        Ok(config) => Ok(config),
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `traverse config path`."
            );
            Ok(Config::default())
        }
    }
}

/// Exit code for a failed command: the library taxonomy when the cause is a
/// library error, 1 otherwise.
fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(e) = error.downcast_ref::<TraverseError>() {
        e.exit_code()
    } else if error.downcast_ref::<ConfigError>().is_some() {
        78
    } else {
        1
    }
}
