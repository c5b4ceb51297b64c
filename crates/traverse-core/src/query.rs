//! Optional query preprocessing ahead of retrieval.
//!
//! A [`QueryTransform`] rewrites the raw query (text in, text out). The shipped
//! [`OllamaExpander`] appends related place terms generated by a small local
//! model. Transforms never decide the result: the orchestrator falls back to
//! the original query when one fails.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::config::QueryExpansionConfig;
use crate::error::BackendError;

/// Text-in, text-out query rewrite.
#[async_trait]
pub trait QueryTransform: Send + Sync {
    fn name(&self) -> &str;

    async fn transform(&self, query: &str) -> Result<String, BackendError>;
}

/// LLM query expansion via Ollama `/api/generate`.
pub struct OllamaExpander {
    endpoint: String,
    model: String,
    max_terms: usize,
    client: reqwest::Client,
    /// Normalized query → expansion terms, bounded by `cache_capacity`
    cache: Cache<String, Arc<Vec<String>>>,
}

impl OllamaExpander {
    pub fn new(config: &QueryExpansionConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_terms: config.max_terms,
            client: reqwest::Client::new(),
            cache: Cache::builder().max_capacity(config.cache_capacity).build(),
        }
    }

    async fn generate(&self, query: &str) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(query, self.max_terms),
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                num_predict: 50,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::QueryTransform {
                message: format!("Ollama request failed: {e}"),
                status_code: None,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::QueryTransform {
                message: format!("Ollama HTTP {status}: {text}"),
                status_code: Some(status.as_u16()),
            });
        }

        let parsed: GenerateResponse = resp.json().await.map_err(|e| BackendError::QueryTransform {
            message: format!("Failed to parse Ollama response: {e}"),
            status_code: None,
        })?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl QueryTransform for OllamaExpander {
    fn name(&self) -> &str {
        "ollama-expansion"
    }

    async fn transform(&self, query: &str) -> Result<String, BackendError> {
        let query = query.trim();
        let key = normalize(query);
        let terms = match self.cache.get(&key) {
            Some(terms) => terms,
            None => {
                let response = self.generate(query).await?;
                let terms = Arc::new(parse_terms(&response, query, self.max_terms));
                self.cache.insert(key, Arc::clone(&terms));
                terms
            }
        };

        let expanded = append_terms(query, &terms);
        tracing::debug!("Expanded '{query}' → '{expanded}'");
        Ok(expanded)
    }
}

fn normalize(query: &str) -> String {
    query.trim().to_lowercase()
}

fn build_prompt(query: &str, max_terms: usize) -> String {
    format!(
        "Tu enrichis des requêtes pour chercher des lieux sur une carte.\n\
         Donne des synonymes et des types de lieux liés, séparés par des virgules.\n\
         Au maximum {max_terms} termes uniques, sans répétition.\n\n\
         Exemples:\n\
         - \"café\" → espresso, terrasse, salon de thé, coffee shop, bar\n\
         - \"faire du sport\" → gymnase, stade, piscine, terrain, salle de sport\n\
         - \"essence\" → station-service, carburant, diesel, pompe\n\n\
         Requête: \"{query}\"\n\
         Termes liés:"
    )
}

/// Pull usable terms out of a model reply.
///
/// Keeps the first line, splits on commas (whitespace if there are none),
/// lowercases, and drops terms of two characters or fewer, repeats and words
/// already in the query.
fn parse_terms(response: &str, query: &str, max_terms: usize) -> Vec<String> {
    let first_line = response.trim().lines().next().unwrap_or("").replace('-', "");
    let first_line = first_line.trim();

    let raw: Vec<String> = if first_line.contains(',') {
        first_line.split(',').map(|t| t.trim().to_lowercase()).collect()
    } else {
        first_line.split_whitespace().map(str::to_lowercase).collect()
    };

    let query_words: HashSet<String> = query.split_whitespace().map(str::to_lowercase).collect();
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|t| t.chars().count() > 2 && !query_words.contains(t))
        .filter(|t| seen.insert(t.clone()))
        .take(max_terms)
        .collect()
}

fn append_terms(query: &str, terms: &[String]) -> String {
    if terms.is_empty() {
        query.to_string()
    } else {
        format!("{query} {}", terms.join(" "))
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_comma_separated_terms() {
        let terms = parse_terms(" Restaurant, brasserie, fast-food, bar, restaurant\nignored, line", "où manger", 10);
        assert_eq!(terms, vec!["restaurant", "brasserie", "fastfood", "bar"]);
    }

    #[test]
    fn test_parse_whitespace_separated_terms() {
        let terms = parse_terms("piscine stade de gym", "sport", 10);
        assert_eq!(terms, vec!["piscine", "stade", "gym"]);
    }

    #[test]
    fn test_parse_drops_query_words_and_caps() {
        let terms = parse_terms("café, terrasse, bar, salon de thé, bistrot", "Café", 2);
        assert_eq!(terms, vec!["terrasse", "bar"]);
    }

    #[test]
    fn test_append_terms() {
        assert_eq!(append_terms("où manger", &["restaurant".to_string()]), "où manger restaurant");
        assert_eq!(append_terms("où manger", &[]), "où manger");
    }

    #[test]
    fn test_normalize_for_cache() {
        assert_eq!(normalize("  Où Manger "), "où manger");
    }

    fn offline_expander() -> OllamaExpander {
        OllamaExpander::new(&QueryExpansionConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..QueryExpansionConfig::default()
        })
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let expander = offline_expander();
        expander
            .cache
            .insert(normalize("Boulangerie"), Arc::new(vec!["pain".to_string()]));
        assert_eq!(expander.transform("boulangerie ").await.unwrap(), "boulangerie pain");
    }

    #[tokio::test]
    async fn test_cache_hit_keeps_each_callers_text() {
        let expander = offline_expander();
        expander.cache.insert(
            normalize("Où manger"),
            Arc::new(vec!["restaurant".to_string(), "brasserie".to_string()]),
        );

        assert_eq!(
            expander.transform("OÙ MANGER").await.unwrap(),
            "OÙ MANGER restaurant brasserie"
        );
        assert_eq!(
            expander.transform("  où manger").await.unwrap(),
            "où manger restaurant brasserie"
        );
    }

    #[test]
    fn test_cache_is_bounded_by_config() {
        let expander = OllamaExpander::new(&QueryExpansionConfig {
            cache_capacity: 16,
            ..QueryExpansionConfig::default()
        });
        assert_eq!(expander.cache.policy().max_capacity(), Some(16));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transform_error() {
        let expander = OllamaExpander::new(&QueryExpansionConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..QueryExpansionConfig::default()
        });
        let err = expander.transform("pharmacie").await.unwrap_err();
        assert!(matches!(err, BackendError::QueryTransform { .. }));
    }
}
