// src/llm/sse.rs
// Server-sent event decoding and the Messages API stream state machine

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::types::{ContentBlock, TokenUsage, ToolUse, WireUsage};
use crate::error::{PilotError, Result};

/// One `event:`/`data:` frame
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental frame decoder. Buffers raw bytes so multi-byte characters
/// split across chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a frame boundary
    scanned: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().filter(|b| **b != b'\r'));

        let mut frames = Vec::new();
        let mut start = 0;
        // back up one byte so a boundary split across chunks is still found
        let mut from = self.scanned.saturating_sub(1);
        while let Some(offset) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") {
            let end = from + offset;
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&self.buffer[start..end])) {
                frames.push(frame);
            }
            start = end + 2;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        frames
    }

    /// Flush a trailing frame that was not followed by a blank line
    pub fn finish(&mut self) -> Option<SseFrame> {
        let raw = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        parse_frame(&String::from_utf8_lossy(&raw))
    }
}

fn parse_frame(frame: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.starts_with(':') {
            continue; // comment/heartbeat
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    SignatureDelta {
        signature: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// Incremental output of the adapter
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    ToolUse(ToolUse),
}

#[derive(Debug)]
enum BlockState {
    Text(String),
    Thinking { thinking: String, signature: String },
    Redacted(String),
    ToolUse { id: String, name: String, json: String },
    ServerToolUse { id: String, name: String, json: String },
    /// Blocks delivered whole in content_block_start (web search results)
    Complete(ContentBlock),
}

/// Everything a finished inference call produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// Assistant content in block order, ready for the conversation log
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

/// State machine over Messages API stream events
#[derive(Debug, Default)]
pub struct ClaudeStreamAdapter {
    open: BTreeMap<usize, BlockState>,
    closed: BTreeMap<usize, ContentBlock>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    stopped: bool,
}

impl ClaudeStreamAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Handle one `data:` payload. Unparseable events are fatal; tool
    /// arguments that fail to parse are dropped with a warning.
    pub fn handle(&mut self, data: &str) -> Result<Vec<StreamDelta>> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(vec![]);
        }
        let event: ApiEvent = serde_json::from_str(data)
            .map_err(|e| PilotError::Stream(format!("malformed stream event: {e}")))?;

        let mut out = Vec::new();
        match event {
            ApiEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    usage.apply_to(&mut self.usage);
                }
            }
            ApiEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let Some(state) = self.start_block(content_block, &mut out) {
                    self.open.insert(index, state);
                }
            }
            ApiEvent::ContentBlockDelta { index, delta } => {
                self.apply_delta(index, delta, &mut out);
            }
            ApiEvent::ContentBlockStop { index } => {
                if let Some(state) = self.open.remove(&index) {
                    self.close_block(index, state, &mut out);
                }
            }
            ApiEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    usage.apply_to(&mut self.usage);
                }
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
            }
            ApiEvent::MessageStop => self.stopped = true,
            ApiEvent::Ping | ApiEvent::Unknown => {}
            ApiEvent::Error { error } => {
                return Err(PilotError::Upstream {
                    status: error_status(&error.error_type),
                    message: if error.message.is_empty() {
                        error.error_type
                    } else {
                        error.message
                    },
                });
            }
        }
        Ok(out)
    }

    fn start_block(&self, block: Value, out: &mut Vec<StreamDelta>) -> Option<BlockState> {
        let kind = block["type"].as_str().unwrap_or_default().to_string();
        let str_field = |name: &str| block[name].as_str().unwrap_or_default().to_string();

        match kind.as_str() {
            "text" => {
                let text = str_field("text");
                if !text.is_empty() {
                    out.push(StreamDelta::Text(text.clone()));
                }
                Some(BlockState::Text(text))
            }
            "thinking" => Some(BlockState::Thinking {
                thinking: str_field("thinking"),
                signature: str_field("signature"),
            }),
            "redacted_thinking" => Some(BlockState::Redacted(str_field("data"))),
            "tool_use" => Some(BlockState::ToolUse {
                id: str_field("id"),
                name: str_field("name"),
                json: String::new(),
            }),
            "server_tool_use" => Some(BlockState::ServerToolUse {
                id: str_field("id"),
                name: str_field("name"),
                json: String::new(),
            }),
            _ => match serde_json::from_value::<ContentBlock>(block) {
                Ok(complete) => Some(BlockState::Complete(complete)),
                Err(e) => {
                    debug!(kind = %kind, error = %e, "Ignoring unsupported content block");
                    None
                }
            },
        }
    }

    fn apply_delta(&mut self, index: usize, delta: Delta, out: &mut Vec<StreamDelta>) {
        let Some(state) = self.open.get_mut(&index) else {
            debug!(index, "Delta for unknown block");
            return;
        };

        match (state, delta) {
            (BlockState::Text(text), Delta::TextDelta { text: chunk }) => {
                text.push_str(&chunk);
                out.push(StreamDelta::Text(chunk));
            }
            (BlockState::Thinking { thinking, .. }, Delta::ThinkingDelta { thinking: chunk }) => {
                thinking.push_str(&chunk);
                out.push(StreamDelta::Thinking(chunk));
            }
            (BlockState::Thinking { signature, .. }, Delta::SignatureDelta { signature: sig }) => {
                signature.push_str(&sig);
            }
            (
                BlockState::ToolUse { json, .. } | BlockState::ServerToolUse { json, .. },
                Delta::InputJsonDelta { partial_json },
            ) => json.push_str(&partial_json),
            _ => {}
        }
    }

    fn close_block(&mut self, index: usize, state: BlockState, out: &mut Vec<StreamDelta>) {
        let block = match state {
            BlockState::Text(text) => ContentBlock::text(text),
            BlockState::Thinking {
                thinking,
                signature,
            } => ContentBlock::Thinking {
                thinking,
                signature,
            },
            BlockState::Redacted(data) => ContentBlock::RedactedThinking { data },
            BlockState::ToolUse { id, name, json } => {
                let Some(input) = parse_tool_input(&name, &json) else {
                    return;
                };
                let call = ToolUse { id, name, input };
                out.push(StreamDelta::ToolUse(call.clone()));
                call.into()
            }
            BlockState::ServerToolUse { id, name, json } => {
                let Some(input) = parse_tool_input(&name, &json) else {
                    return;
                };
                ContentBlock::ServerToolUse { id, name, input }
            }
            BlockState::Complete(block) => block,
        };
        self.closed.insert(index, block);
    }

    /// Finish the call. A stream that ended without `message_stop` is an error.
    pub fn finish(mut self) -> Result<StreamOutcome> {
        if !self.stopped {
            return Err(PilotError::Stream(
                "stream ended before message_stop".to_string(),
            ));
        }

        // Blocks never closed still belong to the message
        let open = std::mem::take(&mut self.open);
        let mut ignored = Vec::new();
        for (index, state) in open {
            self.close_block(index, state, &mut ignored);
        }

        let content = self
            .closed
            .into_values()
            .filter(|b| !b.is_blank())
            .collect();

        Ok(StreamOutcome {
            content,
            usage: self.usage,
            stop_reason: self.stop_reason,
        })
    }
}

/// Empty argument buffers mean a no-argument call
fn parse_tool_input(name: &str, json: &str) -> Option<Value> {
    if json.trim().is_empty() {
        return Some(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(json) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            warn!(tool = name, "Dropping tool call with non-object input");
            None
        }
        Err(e) => {
            warn!(tool = name, error = %e, "Dropping tool call with invalid JSON input");
            None
        }
    }
}

fn error_status(error_type: &str) -> u16 {
    match error_type {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    }
}
