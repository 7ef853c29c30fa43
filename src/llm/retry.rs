//! Bounded retry for upstream LLM calls.
//!
//! Transient failures (rate limits, 5xx, timeouts, connection errors) are
//! retried with exponential backoff and jitter, honoring `Retry-After`.
//! Everything else is returned on the first attempt.

use std::time::Duration;

use rand::Rng;
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::models::llm::{classify_error, error_message, LlmErrorType};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    /// Upper bound on a server-requested `Retry-After` wait.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            jitter_ms: 250,
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

struct Failure {
    class: LlmErrorType,
    message: String,
    retry_after: Option<Duration>,
}

/// Send the request built by `build` (called once per attempt) and decode a
/// JSON body from the first successful response.
pub async fn send_json<F>(provider: &str, policy: &RetryPolicy, build: F) -> Result<Value, AppError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let failure = match build().send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.map_err(|e| {
                    AppError::upstream(provider, LlmErrorType::Network, e.without_url().to_string())
                })?;
                return serde_json::from_str(&body).map_err(|e| {
                    AppError::upstream(
                        provider,
                        LlmErrorType::InvalidResponse,
                        format!("malformed response body: {}", e),
                    )
                });
            }
            Ok(response) => failure_from_response(response).await,
            Err(e) => Failure {
                class: if e.is_timeout() {
                    LlmErrorType::Timeout
                } else if e.is_connect() || e.is_request() {
                    LlmErrorType::Network
                } else {
                    LlmErrorType::Other
                },
                message: e.without_url().to_string(),
                retry_after: None,
            },
        };

        if !failure.class.is_transient() {
            debug!(provider, class = %failure.class, "upstream error is not retryable");
            return Err(AppError::upstream(provider, failure.class, failure.message));
        }
        if attempt > policy.max_retries {
            warn!(
                provider,
                attempts = attempt,
                class = %failure.class,
                "upstream retries exhausted"
            );
            return Err(AppError::upstream(provider, failure.class, failure.message));
        }

        let wait = failure
            .retry_after
            .map(|d| d.min(policy.max_retry_after))
            .unwrap_or_else(|| calculate_backoff(policy, attempt));

        warn!(
            provider,
            attempt,
            max_attempts = policy.max_retries + 1,
            class = %failure.class,
            wait_ms = wait.as_millis() as u64,
            "upstream call failed, retrying"
        );
        sleep(wait).await;
    }
}

async fn failure_from_response(response: Response) -> Failure {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    Failure {
        class: classify_error(status, &body),
        message: format!("HTTP {}: {}", status, error_message(&body)),
        retry_after,
    }
}

fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_backoff_ms as f64;
    let max = policy.max_backoff_ms as f64;

    // Exponential: base * 2^(attempt - 1)
    let raw_backoff = base * 2_f64.powi((attempt as i32) - 1);
    let capped_backoff = raw_backoff.min(max);

    let jitter = if policy.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    } else {
        0
    };

    Duration::from_millis((capped_backoff as u64) + jitter)
}
