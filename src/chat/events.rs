// src/chat/events.rs
// Events streamed to the client, one JSON object per line

use serde::Serialize;

use crate::llm::{TokenUsage, ToolUse};
use crate::tools::FileChange;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        tool_call: ToolUse,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        result: String,
    },
    RoundStart {
        message: String,
    },
    ToolStart {
        message: String,
    },
    Done {
        cost: f64,
        saved_percent: f64,
        usage: TokenUsage,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_changes: Option<Vec<FileChange>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
    },
    /// Terminal
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Serialize as one NDJSON line, newline included
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"event serialization failed: {e}"}}"#)
        });
        line.push('\n');
        line
    }
}
