// src/llm/http_client.rs
// HTTP client with retry for opening inference calls

use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::error::{PilotError, Result};

/// Default maximum retry attempts for transient failures
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Base backoff between retries (doubles each attempt, plus jitter)
const DEFAULT_BASE_BACKOFF_MS: u64 = 1000;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Longest server-requested `retry-after` we are willing to honour
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// Shared HTTP client for the Messages API.
///
/// Only the opening request is retried. Once a response body starts
/// streaming, failures belong to the caller.
#[derive(Clone)]
pub struct LlmHttpClient {
    client: Client,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for LlmHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmHttpClient {
    pub fn new() -> Self {
        // No overall timeout: streams can legitimately run for minutes.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Send a request, retrying 429/5xx and connect/timeout failures.
    ///
    /// `build_request` is called once per attempt. Returns the successful
    /// response with its body unread.
    pub async fn send_with_retry<F>(&self, request_id: &str, build_request: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 0u32;
        let mut backoff = self.base_backoff;

        loop {
            attempt += 1;
            let last_attempt = attempt >= self.max_attempts;

            match build_request(&self.client).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let retry_after = retry_after(&response);
                    let body = response.text().await.unwrap_or_default();

                    if !last_attempt && is_transient(status) {
                        let wait = retry_after.unwrap_or_else(|| with_jitter(backoff));
                        warn!(
                            request_id,
                            status = status.as_u16(),
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "Transient upstream error, retrying"
                        );
                        tokio::time::sleep(wait).await;
                        backoff *= 2;
                        continue;
                    }

                    return Err(PilotError::Upstream {
                        status: status.as_u16(),
                        message: upstream_message(&body),
                    });
                }
                Err(e) => {
                    // Only connect/timeout failures are known not to have reached the model
                    if !last_attempt && (e.is_connect() || e.is_timeout()) {
                        let wait = with_jitter(backoff);
                        warn!(
                            request_id,
                            error = %e,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "Upstream request failed, retrying"
                        );
                        tokio::time::sleep(wait).await;
                        backoff *= 2;
                        continue;
                    }
                    return Err(PilotError::Http(e));
                }
            }
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Add up to 50% random jitter
fn with_jitter(backoff: Duration) -> Duration {
    let base = backoff.as_millis() as u64;
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs <= MAX_RETRY_AFTER_SECS)
        .map(Duration::from_secs)
}

/// Extract `error.message` from an Anthropic error body
pub fn upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "empty response body".to_string()
            } else {
                trimmed.chars().take(500).collect()
            }
        })
}
