//! The `traverse search` command.

use std::io::{IsTerminal, Write};

use anyhow::Context;
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use traverse_core::{Config, OutputFormat, OutputWriter, SelectionPolicy, Traverse};

/// Arguments for the `search` command.
#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Query text. Without it, queries are read from stdin, one per line,
    /// until an empty line
    pub query: Option<String>,

    /// Results kept per Popular/Niche bucket
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Usage count at or above which a tag is Popular
    #[arg(long)]
    pub threshold: Option<u64>,

    /// Output format: json or jsonl
    #[arg(short, long)]
    pub format: Option<String>,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

impl SearchArgs {
    fn output_format(&self, config: &Config) -> anyhow::Result<OutputFormat> {
        let name = self.format.as_deref().unwrap_or(&config.output.format);
        OutputFormat::parse(name)
            .with_context(|| format!("Unknown output format '{name}' (expected json or jsonl)"))
    }

    fn policy(&self, config: &Config) -> anyhow::Result<SelectionPolicy> {
        let mut policy = SelectionPolicy::from_config(&config.selection);
        if let Some(top_k) = self.top_k {
            anyhow::ensure!(top_k > 0, "--top-k must be at least 1");
            policy = policy.with_top_k(top_k);
        }
        if let Some(threshold) = self.threshold {
            policy = policy.with_threshold(threshold);
        }
        Ok(policy)
    }
}

/// Execute the search command.
pub async fn execute(args: SearchArgs, config: Config) -> anyhow::Result<()> {
    let format = args.output_format(&config)?;
    let policy = args.policy(&config)?;
    let pretty = args.pretty || config.output.pretty;

    let traverse = Traverse::new(config).await?;
    tracing::debug!(
        "Embedder: {}, reranker: {}",
        traverse.embedder_name(),
        traverse.reranker_name()
    );

    let mut writer = OutputWriter::new(std::io::stdout(), format, pretty);

    match args.query {
        Some(query) => run_query(&traverse, &policy, &query, &mut writer).await?,
        None => interactive(&traverse, &policy, &mut writer).await?,
    }

    tracing::debug!("Wrote {} match(es)", writer.items_written());
    Ok(())
}

async fn run_query<W: Write>(
    traverse: &Traverse,
    policy: &SelectionPolicy,
    query: &str,
    writer: &mut OutputWriter<W>,
) -> anyhow::Result<()> {
    let outcome = traverse.search_with(query, policy).await?;
    if outcome.stats.fallback_used {
        tracing::warn!("Results for '{query}' are ordered by retrieval score (reranker unavailable)");
    }
    writer.write_matches(&outcome.matches())?;
    writer.flush()?;
    Ok(())
}

/// Console search: one query per line until an empty line or end of input.
///
/// A failing query is logged and the loop keeps going.
async fn interactive<W: Write>(
    traverse: &Traverse,
    policy: &SelectionPolicy,
    writer: &mut OutputWriter<W>,
) -> anyhow::Result<()> {
    let prompt = std::io::stdin().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        if prompt {
            eprint!("query› ");
            std::io::stderr().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            break;
        }
        if let Err(e) = run_query(traverse, policy, query, writer).await {
            tracing::error!("Search failed for '{query}': {e:#}");
        }
    }

    Ok(())
}
