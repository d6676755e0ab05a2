//! repopilot - agentic chat over a GitHub repository
//!
//! A model inspects and edits a remote repository through a fixed set of
//! tools while its text, reasoning, and tool activity stream to the client.

pub mod cache;
pub mod chat;
pub mod config;
pub mod error;
pub mod github;
pub mod llm;
pub mod server;
pub mod tools;

pub use error::{PilotError, Result};
