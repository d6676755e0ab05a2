//! HTTP server
//!
//! - POST /api/chat/stream - NDJSON streaming chat
//! - POST /api/chat - Non-streaming chat
//! - GET /api/models - Model catalogue for the caller's key
//! - GET /api/usage, POST /api/usage/reset - Cost totals
//! - GET /api/status - Health check

pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, Method, header},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::chat::ChatEngine;

/// Uploaded files travel base64-encoded in the JSON body
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
}

impl AppState {
    pub fn new(engine: ChatEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(handlers::API_KEY_HEADER),
            HeaderName::from_static(handlers::GITHUB_TOKEN_HEADER),
        ]);

    Router::new()
        .route("/api/status", get(handlers::status_handler))
        .route("/api/chat/stream", post(handlers::chat_stream_handler))
        .route("/api/chat", post(handlers::chat_handler))
        .route("/api/models", get(handlers::models_handler))
        .route("/api/usage", get(handlers::usage_handler))
        .route("/api/usage/reset", post(handlers::usage_reset_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server until the process is stopped
pub async fn run(engine: ChatEngine) -> Result<()> {
    let addr: SocketAddr =
        format!("{}:{}", engine.config().host, engine.config().port).parse()?;
    let app = create_router(AppState::new(engine));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "repopilot listening");
    axum::serve(listener, app).await?;

    Ok(())
}
