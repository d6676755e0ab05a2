// src/chat/message.rs
// Client-facing assistant message, built up from the event stream

use serde::Serialize;

use super::events::ChatEvent;
use crate::llm::{Role, TokenUsage};
use crate::tools::FileChange;

/// One tool invocation as the client sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAction {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Assistant message: created streaming, grown by deltas, finalized by the
/// terminal event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    pub tool_calls: Vec<ToolAction>,
    pub file_changes: Vec<FileChange>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub saved_percent: f64,
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix seconds
    pub created_at: i64,
}

impl Default for AssistantMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl AssistantMessage {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            thinking: String::new(),
            tool_calls: Vec::new(),
            file_changes: Vec::new(),
            usage: TokenUsage::default(),
            cost: 0.0,
            saved_percent: 0.0,
            streaming: true,
            pr_url: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Fold one event into the message
    pub fn apply(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::Text { content } => self.content.push_str(content),
            ChatEvent::Thinking { content } => self.thinking.push_str(content),
            ChatEvent::ToolUse { tool_call } => self.tool_calls.push(ToolAction {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                input: tool_call.input.clone(),
                result: None,
            }),
            ChatEvent::ToolResult {
                tool_use_id,
                result,
                ..
            } => {
                if let Some(action) = self.tool_calls.iter_mut().find(|a| &a.id == tool_use_id) {
                    action.result = Some(result.clone());
                }
            }
            ChatEvent::RoundStart { .. } | ChatEvent::ToolStart { .. } => {}
            ChatEvent::Done {
                cost,
                saved_percent,
                usage,
                file_changes,
                pr_url,
            } => {
                self.cost = *cost;
                self.saved_percent = *saved_percent;
                self.usage = *usage;
                self.file_changes = file_changes.clone().unwrap_or_default();
                self.pr_url = pr_url.clone();
                self.streaming = false;
            }
            ChatEvent::Error { message } => {
                self.error = Some(message.clone());
                self.streaming = false;
            }
        }
    }
}
