// src/llm/mod.rs
// Model-facing layer: wire types, effort budgets, pricing, and the streaming client

pub mod anthropic;
pub mod effort;
pub mod http_client;
pub mod pricing;
pub mod sse;
pub mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{PilotError, Result};

pub use anthropic::AnthropicClient;
pub use effort::Effort;
pub use pricing::{CostAccountant, CostTracker, ModelPricing, UsageTotals};
pub use sse::StreamDelta;
pub use types::{
    CacheControl, ContentBlock, MediaSource, Message, ModelInfo, Role, TokenUsage, Tool, ToolUse,
};

/// Capacity of the per-call event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Everything needed for one inference call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// System prompt and context blocks; the caller marks cacheable prefixes
    pub system: Vec<ContentBlock>,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    /// Declare the server-side web search tool
    pub web_search: bool,
    pub effort: Effort,
    pub thinking: bool,
}

/// Terminal summary of one inference call
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Assistant content in block order, including thinking signatures
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub stop_reason: Option<String>,
}

/// Typed events of one inference call: deltas in arrival order, then
/// exactly one `Done` or `Error`.
#[derive(Debug)]
pub enum ModelEvent {
    Text(String),
    Thinking(String),
    ToolUse(ToolUse),
    Done(Completion),
    Error(PilotError),
}

impl From<StreamDelta> for ModelEvent {
    fn from(delta: StreamDelta) -> Self {
        match delta {
            StreamDelta::Text(text) => ModelEvent::Text(text),
            StreamDelta::Thinking(text) => ModelEvent::Thinking(text),
            StreamDelta::ToolUse(call) => ModelEvent::ToolUse(call),
        }
    }
}

/// A streaming chat model.
///
/// Dropping the receiver or cancelling the token stops the call; no
/// further network traffic is issued for it.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn stream(&self, request: ChatRequest, cancel: CancellationToken) -> mpsc::Receiver<ModelEvent>;

    /// Models available to the configured key
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}
