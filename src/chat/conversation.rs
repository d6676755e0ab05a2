// src/chat/conversation.rs
// Append-only conversation log owned by one turn

use std::collections::HashSet;

use crate::error::{PilotError, Result};
use crate::llm::{ContentBlock, Message, Role, ToolUse};
use crate::tools::ToolResult;

/// Message log for one turn.
///
/// Roles alternate, starting with the caller's history (which ends with a
/// user message). Every assistant entry carrying tool_use blocks must be
/// answered by exactly one user entry of matching tool_result blocks before
/// anything else is appended. A paused assistant entry stays open: the next
/// round's content extends it instead of starting a new entry.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    messages: Vec<Message>,
    pending: Vec<String>,
    paused: bool,
}

impl ConversationLog {
    pub fn new(history: Vec<Message>) -> Result<Self> {
        match history.last() {
            Some(last) if last.role == Role::User => {}
            Some(_) => {
                return Err(PilotError::InvalidInput(
                    "conversation must end with a user message".into(),
                ));
            }
            None => return Err(PilotError::InvalidInput("no messages".into())),
        }
        if history.windows(2).any(|w| w[0].role == w[1].role) {
            return Err(PilotError::InvalidInput(
                "message roles must alternate".into(),
            ));
        }

        Ok(Self {
            messages: history,
            pending: Vec::new(),
            paused: false,
        })
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// tool_use ids still awaiting results
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// True while the trailing assistant entry waits to be resumed
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn check_assistant_turn(&self) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(PilotError::Stream(
                "assistant turn appended before tool results".into(),
            ));
        }
        if !self.paused && self.messages.last().map(|m| m.role) != Some(Role::User) {
            return Err(PilotError::Stream(
                "assistant turn must follow a user turn".into(),
            ));
        }
        Ok(())
    }

    fn push_assistant(&mut self, content: Vec<ContentBlock>) {
        if self.paused {
            self.paused = false;
            if let Some(last) = self.messages.last_mut() {
                last.content.extend(content);
                return;
            }
        }
        self.messages.push(Message::new(Role::Assistant, content));
    }

    /// Append content of a round the upstream paused (server tools still
    /// running). The next request resumes from it as-is.
    pub fn append_paused(&mut self, content: Vec<ContentBlock>) -> Result<()> {
        self.check_assistant_turn()?;
        let content = content.into_iter().filter(|b| !b.is_blank()).collect();
        self.push_assistant(content);
        self.paused = true;
        Ok(())
    }

    /// Append one round's assistant content, reconciled against the calls that
    /// will actually be answered: tool_use blocks outside `calls` are dropped
    /// and calls missing from the content are appended.
    pub fn append_assistant(&mut self, content: Vec<ContentBlock>, calls: &[ToolUse]) -> Result<()> {
        self.check_assistant_turn()?;

        let wanted: HashSet<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        let mut content: Vec<ContentBlock> = content
            .into_iter()
            .filter(|b| match b {
                ContentBlock::ToolUse { id, .. } => wanted.contains(id.as_str()),
                _ => !b.is_blank(),
            })
            .collect();

        let present: HashSet<String> = content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        for call in calls {
            if !present.contains(&call.id) {
                content.push(call.clone().into());
            }
        }

        self.pending = calls.iter().map(|c| c.id.clone()).collect();
        self.push_assistant(content);
        Ok(())
    }

    /// Answer every pending tool_use, in the order the calls were made
    pub fn append_tool_results(&mut self, results: &[ToolResult]) -> Result<()> {
        let answered: Vec<&str> = results.iter().map(|r| r.tool_use_id.as_str()).collect();
        if answered != self.pending.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(PilotError::Stream(format!(
                "tool results {:?} do not answer pending calls {:?}",
                answered, self.pending
            )));
        }

        let blocks = results
            .iter()
            .map(|r| ContentBlock::ToolResult {
                tool_use_id: r.tool_use_id.clone(),
                content: r.content.clone(),
                is_error: r.is_error,
            })
            .collect();
        self.messages.push(Message::new(Role::User, blocks));
        self.pending.clear();
        Ok(())
    }
}
