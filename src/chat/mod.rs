//! Chat orchestration
//!
//! A turn flows through these modules in order:
//! - `context` validates the payload and assembles the system prefix
//! - `engine` binds credentials and the repository cache
//! - `orchestrator` runs the bounded tool loop over a `ConversationLog`
//! - `events` is the NDJSON vocabulary streamed back to the client

pub mod context;
mod conversation;
pub mod engine;
pub mod events;
pub mod message;
pub mod orchestrator;

pub use context::ChatPayload;
pub use conversation::ConversationLog;
pub use engine::{ChatEngine, Connector, Credentials, HttpConnector, PreparedTurn};
pub use events::ChatEvent;
pub use message::AssistantMessage;
pub use orchestrator::{ConversationOrchestrator, StopReason, TurnRequest, TurnSummary};
