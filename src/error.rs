// src/error.rs
// Error types shared by the repository, model, and orchestration layers

use thiserror::Error;

/// Main error type for repopilot
#[derive(Error, Debug)]
pub enum PilotError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{path} is {size} bytes, over the {limit} byte limit")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("old_str not found in {path}")]
    TargetNotFound { path: String },

    #[error("old_str found {count} times in {path}")]
    AmbiguousTarget { path: String, count: usize },

    #[error("repository API error {status}: {message}")]
    Repository { status: u16, message: String },

    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("no repository configured for this conversation")]
    NoRepository,

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using PilotError
pub type Result<T> = std::result::Result<T, PilotError>;

impl PilotError {
    /// True for failures the model can work around by adjusting its tool input
    pub fn is_retryable_by_model(&self) -> bool {
        matches!(
            self,
            Self::TargetNotFound { .. }
                | Self::AmbiguousTarget { .. }
                | Self::NotFound(_)
                | Self::FileTooLarge { .. }
                | Self::InvalidInput(_)
        )
    }

    /// HTTP status to report for this error at the API boundary
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound(_) => 404,
            Self::Upstream { status, .. } => match status {
                429 => 429,
                401 | 403 => 401,
                400 => 400,
                _ => 502,
            },
            Self::MissingCredential(_) => 401,
            Self::Config(_) => 500,
            Self::Cancelled => 499,
            _ => 502,
        }
    }
}

impl From<tokio::task::JoinError> for PilotError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            PilotError::Cancelled
        } else {
            PilotError::Stream(err.to_string())
        }
    }
}
