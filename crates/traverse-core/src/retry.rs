//! Retry utilities for transient backend failures.
//!
//! Provides classification of retryable errors and exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::{BackendError, Stage};

/// Determine whether a backend error is worth retrying.
///
/// Retryable errors: timeouts, rate limits (429), server errors (5xx).
/// Non-retryable: auth failures, bad requests, malformed responses.
pub fn is_retryable(error: &BackendError) -> bool {
    match error {
        BackendError::Timeout { .. } => true,
        BackendError::Embedding {
            status_code,
            message,
        }
        | BackendError::Rerank {
            status_code,
            message,
        }
        | BackendError::QueryTransform {
            status_code,
            message,
        } => {
            if let Some(code) = status_code {
                return *code == 429 || (500..=599).contains(code);
            }
            // Non-HTTP failures (connection refused, DNS)
            message.contains("timed out") || message.contains("connect")
        }
    }
}

/// Calculate exponential backoff duration for a given attempt.
///
/// Uses `base_delay * 2^attempt` with a cap at 30 seconds.
pub fn backoff_duration(attempt: u32, base_delay_ms: u64) -> Duration {
    let delay = base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay.min(30_000))
}

/// Retry budget for one stage.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Per-attempt limit
    pub timeout_ms: u64,
}

/// A stage that failed for good.
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub stage: Stage,
    pub attempts: u32,
    pub last_error: BackendError,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget runs out. Each attempt is bounded by `policy.timeout_ms`.
pub async fn with_retry<T, F, Fut>(
    stage: Stage,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let timeout = Duration::from_millis(policy.timeout_ms);
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                stage,
                timeout_ms: policy.timeout_ms,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.retry_attempts && is_retryable(&e) => {
                let delay = backoff_duration(attempt, policy.retry_delay_ms);
                tracing::warn!(
                    "{stage} attempt {} failed: {e}. Retrying in {}ms",
                    attempt + 1,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(Exhausted {
                    stage,
                    attempts: attempt + 1,
                    last_error: e,
                })
            }
        }
    }
}
