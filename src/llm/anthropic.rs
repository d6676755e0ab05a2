// src/llm/anthropic.rs
// Anthropic Messages API client: streaming inference and the model catalogue

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http_client::{LlmHttpClient, upstream_message};
use super::pricing::{CostAccountant, get_pricing};
use super::sse::{ClaudeStreamAdapter, SseDecoder};
use super::types::{CacheControl, ModelInfo};
use super::{ChatModel, ChatRequest, Completion, EVENT_CHANNEL_CAPACITY, ModelEvent};
use crate::error::{PilotError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";
const WEB_SEARCH_MAX_USES: u32 = 5;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

#[derive(Clone)]
pub struct AnthropicClient {
    http: LlmHttpClient,
    api_key: String,
    base_url: String,
    idle_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<RawModel>,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: LlmHttpClient::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Abort a stream when no bytes arrive for this long
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    /// Request body for a streaming Messages call
    pub fn build_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.effort.max_tokens(),
            "stream": true,
            "messages": request.messages,
        });

        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }

        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .filter_map(|t| serde_json::to_value(t).ok())
            .collect();
        // Cache breakpoint after the last function tool covers the whole tool prefix
        if let Some(last) = tools.last_mut() {
            last["cache_control"] = json!(CacheControl::ephemeral());
        }
        if request.web_search {
            tools.push(json!({
                "type": WEB_SEARCH_TOOL_TYPE,
                "name": "web_search",
                "max_uses": WEB_SEARCH_MAX_USES,
            }));
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        if request.thinking {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": request.effort.thinking_budget(),
            });
        }

        body
    }

    async fn run_stream(
        self,
        request: ChatRequest,
        tx: mpsc::Sender<ModelEvent>,
        cancel: CancellationToken,
    ) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let accountant = CostAccountant::for_model(&request.model);
        let body = self.build_body(&request);
        let url = self.messages_url();

        debug!(
            request_id = %request_id,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            effort = %request.effort,
            "Opening inference stream"
        );

        let open = self.http.send_with_retry(&request_id, |client| {
            client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
        });
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            response = open => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.send(ModelEvent::Error(e)).await;
                return;
            }
        };

        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut adapter = ClaudeStreamAdapter::new();

        while !adapter.is_stopped() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(request_id = %request_id, "Inference stream cancelled");
                    return;
                }
                next = tokio::time::timeout(self.idle_timeout, bytes.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    warn!(request_id = %request_id, "Inference stream went idle");
                    let message = format!(
                        "no data from upstream for {}s",
                        self.idle_timeout.as_secs()
                    );
                    let _ = tx.send(ModelEvent::Error(PilotError::Stream(message))).await;
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(ModelEvent::Error(PilotError::Http(e))).await;
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            for frame in decoder.push(&chunk) {
                if !forward(&mut adapter, &frame.data, &tx).await {
                    return;
                }
            }
        }

        if let Some(frame) = decoder.finish()
            && !forward(&mut adapter, &frame.data, &tx).await
        {
            return;
        }

        let outcome = match adapter.finish() {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = tx.send(ModelEvent::Error(e)).await;
                return;
            }
        };

        if outcome.usage.cache_read > 0 || outcome.usage.cache_write > 0 {
            info!(
                request_id = %request_id,
                cache_read = outcome.usage.cache_read,
                cache_write = outcome.usage.cache_write,
                "Prompt cache usage"
            );
        }

        let completion = Completion {
            cost: accountant.cost(&outcome.usage),
            content: outcome.content,
            usage: outcome.usage,
            stop_reason: outcome.stop_reason,
        };
        debug!(
            request_id = %request_id,
            input = completion.usage.input,
            output = completion.usage.output,
            cost = completion.cost,
            stop_reason = ?completion.stop_reason,
            "Inference stream complete"
        );
        let _ = tx.send(ModelEvent::Done(completion)).await;
    }
}

/// Push one frame through the adapter and forward its deltas.
/// Returns false when the stream must end (error sent, or receiver gone).
async fn forward(
    adapter: &mut ClaudeStreamAdapter,
    data: &str,
    tx: &mpsc::Sender<ModelEvent>,
) -> bool {
    match adapter.handle(data) {
        Ok(deltas) => {
            for delta in deltas {
                if tx.send(delta.into()).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            let _ = tx.send(ModelEvent::Error(e)).await;
            false
        }
    }
}

#[async_trait]
impl ChatModel for AnthropicClient {
    fn stream(&self, request: ChatRequest, cancel: CancellationToken) -> mpsc::Receiver<ModelEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(self.clone().run_stream(request, tx, cancel));
        rx
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/v1/models?limit=100", self.base_url);
        let response = self
            .http
            .inner()
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PilotError::Upstream {
                status: status.as_u16(),
                message: upstream_message(&body),
            });
        }

        let models: ModelsResponse = response.json().await?;
        Ok(models
            .data
            .into_iter()
            .map(|m| ModelInfo {
                pricing: get_pricing(&m.id),
                id: m.id,
                display_name: m.display_name,
            })
            .collect())
    }
}
