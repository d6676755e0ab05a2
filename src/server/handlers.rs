//! HTTP handlers for chat, models, usage, and status

use std::convert::Infallible;
use std::sync::atomic::Ordering;

use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, header},
    response::Response,
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::chat::{AssistantMessage, ChatEvent, ChatPayload, Credentials};
use crate::llm::EVENT_CHANNEL_CAPACITY;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const GITHUB_TOKEN_HEADER: &str = "x-github-token";

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn credentials(headers: &HeaderMap) -> Credentials {
    Credentials {
        api_key: header_value(headers, API_KEY_HEADER),
        github_token: header_value(headers, GITHUB_TOKEN_HEADER),
    }
}

/// Streaming chat: one JSON event per line. Dropping the response body
/// (client disconnect or stop button) cancels the turn.
#[instrument(skip_all)]
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatPayload>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(payload) = payload?;
    let prepared = state.engine.prepare(payload, &credentials(&headers)).await?;

    let (tx, rx) = mpsc::channel::<ChatEvent>(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        if let Err(e) = prepared.run(tx, cancel).await {
            debug!(error = %e, "Streaming turn ended early");
        }
    });

    let body = ReceiverStream::new(rx).map(move |event| {
        let _live = &guard;
        Ok::<_, Infallible>(event.to_line())
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// Non-streaming chat: the same turn folded into one assistant message
#[instrument(skip_all)]
pub async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatPayload>, JsonRejection>,
) -> ApiResult<Json<AssistantMessage>> {
    let Json(payload) = payload?;
    let prepared = state.engine.prepare(payload, &credentials(&headers)).await?;

    let (tx, mut rx) = mpsc::channel::<ChatEvent>(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let turn = tokio::spawn(prepared.run(tx, cancel));

    let mut message = AssistantMessage::new();
    while let Some(event) = rx.recv().await {
        message.apply(&event);
        if event.is_terminal() {
            break;
        }
    }

    turn.await.map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(message))
}

pub async fn models_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let models = state.engine.list_models(&credentials(&headers)).await?;
    Ok(Json(json!({ "models": models })))
}

pub async fn usage_handler(State(state): State<AppState>) -> Json<Value> {
    let tracker = state.engine.usage().lock().await;
    Json(json!({
        "conversation": tracker.conversation(),
        "lifetime": tracker.lifetime(),
    }))
}

/// Start a new conversation scope. Lifetime totals are kept.
pub async fn usage_reset_handler(State(state): State<AppState>) -> Json<Value> {
    let mut tracker = state.engine.usage().lock().await;
    tracker.reset_conversation();
    Json(json!({
        "conversation": tracker.conversation(),
        "lifetime": tracker.lifetime(),
    }))
}

/// Health check and status endpoint
pub async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let config = state.engine.config();
    let cache = state.engine.cache();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "defaultModel": config.default_model,
        "deployMode": config.deploy_mode,
        "hasApiKey": config.anthropic_api_key.is_some(),
        "hasGithubToken": config.github_token.is_some(),
        "cache": {
            "entries": cache.len(),
            "hits": cache.stats.hits.load(Ordering::Relaxed),
            "misses": cache.stats.misses.load(Ordering::Relaxed),
        },
    }))
}
