//! HTTP routes of the chat front end.

// Axum handlers are async even when they never await
#![allow(clippy::unused_async)]

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::agent::{InvocationError, InvocationLoop, MessageRole};
use crate::config::AppConfig;
use crate::ui::{STARTERS, Starter, index_page};

pub const CLEARED_REPLY: &str = "✅ History cleared and thread reset for this session.";
/// Identity used when a request names no user.
pub const DEFAULT_USER: &str = "anonymous";
const AUTHOR: &str = "Agent";

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health))
        .route("/api/starters", get(api_starters))
        .route("/api/chat", post(api_chat))
        .route("/api/actions/clear_history", post(api_clear_history))
        .route("/api/sessions/{user_id}/messages", get(api_get_messages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server and serve until Ctrl-C.
pub async fn start_server(config: Arc<AppConfig>, invocation: InvocationLoop) -> anyhow::Result<()> {
    info!(
        tools = ?invocation.tools().names(),
        "Chat front end ready"
    );
    let app = router(AppState::new(invocation));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn index_handler() -> impl IntoResponse {
    Html(index_page())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/starters - Example prompts for an empty conversation.
async fn api_starters() -> Json<[Starter; 4]> {
    Json(STARTERS)
}

fn user_or_default(user_id: Option<String>) -> String {
    user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_USER.to_string())
}

/// Request body for chat API.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// Caller identity; one thread per identity.
    #[serde(default)]
    user_id: Option<String>,
    /// User message content.
    message: String,
}

/// A rendered agent reply.
#[derive(Debug, Serialize)]
struct ChatResponse {
    author: &'static str,
    reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
    /// Machine-readable error code when the turn failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

impl ChatResponse {
    fn reply(reply: impl Into<String>, thread_id: Option<String>) -> Self {
        Self {
            author: AUTHOR,
            reply: reply.into(),
            thread_id,
            error: None,
        }
    }

    fn error(code: &'static str, reply: impl Into<String>) -> Self {
        Self {
            author: AUTHOR,
            reply: reply.into(),
            thread_id: None,
            error: Some(code),
        }
    }
}

/// Status, error code and user-facing text for a failed turn.
fn describe_failure(err: &InvocationError) -> (StatusCode, &'static str, String) {
    match err {
        InvocationError::Service(_) => (
            StatusCode::BAD_GATEWAY,
            "upstream",
            "⚠️ The assistant service is unavailable right now. Please try again.".into(),
        ),
        InvocationError::Timeout(after) => (
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            format!(
                "⏱️ The assistant did not answer within {} seconds. Please try again.",
                after.as_secs()
            ),
        ),
        InvocationError::ToolRoundsExceeded(_) => (
            StatusCode::BAD_GATEWAY,
            "tool_rounds_exceeded",
            "⚠️ The assistant needed too many steps for this request. Try a narrower question."
                .into(),
        ),
        InvocationError::RunFailed { status, .. } => (
            StatusCode::BAD_GATEWAY,
            "run_failed",
            format!("⚠️ The assistant could not complete this request ({status})."),
        ),
        InvocationError::Cancelled => (
            StatusCode::from_u16(499).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
            "cancelled",
            "The request was cancelled.".into(),
        ),
    }
}

/// POST /api/chat - Run one turn and return the agent's reply.
async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ChatResponse>) {
    let user_id = user_or_default(req.user_id);
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ChatResponse::error("empty_message", "Message must not be empty.")),
        );
    }

    tracing::info!(
        user_id = %user_id,
        message_length = req.message.len(),
        "Received chat request"
    );

    // Dropping this handler (client went away) cancels the turn; the spawned
    // task then cancels the hosted run.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let invocation = Arc::clone(&state.invocation);
    let message = req.message;
    let turn_user = user_id.clone();
    let turn = tokio::spawn(async move { invocation.run_turn(&turn_user, &message, &cancel).await });

    match turn.await {
        Ok(Ok(turn)) => (
            StatusCode::OK,
            Json(ChatResponse::reply(turn.reply, Some(turn.thread_id))),
        ),
        Ok(Err(e)) => {
            let (status, code, text) = describe_failure(&e);
            if matches!(e, InvocationError::Cancelled) {
                tracing::info!(user_id = %user_id, "Chat turn cancelled");
            } else {
                tracing::error!(user_id = %user_id, error = %e, "Chat turn failed");
            }
            (status, Json(ChatResponse::error(code, text)))
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Chat turn task aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatResponse::error(
                    "internal",
                    "⚠️ Something went wrong while answering. Please try again.",
                )),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClearRequest {
    #[serde(default)]
    user_id: Option<String>,
}

/// POST /api/actions/clear_history - Drop the user's thread.
async fn api_clear_history(
    State(state): State<AppState>,
    Json(req): Json<ClearRequest>,
) -> Json<ChatResponse> {
    let user_id = user_or_default(req.user_id);
    state.invocation.clear_history(&user_id);
    Json(ChatResponse::reply(CLEARED_REPLY, None))
}

/// Message DTO for API responses.
#[derive(Debug, Serialize)]
struct MessageDto {
    role: MessageRole,
    content: String,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    thread_id: String,
    messages: Vec<MessageDto>,
}

/// GET /api/sessions/{user_id}/messages - Messages of the user's current thread.
async fn api_get_messages(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<HistoryResponse>, (StatusCode, String)> {
    match state.invocation.history(&user_id).await {
        Ok(Some((thread_id, messages))) => Ok(Json(HistoryResponse {
            thread_id,
            messages: messages
                .iter()
                .map(|m| MessageDto {
                    role: m.role,
                    content: m.text().unwrap_or_default(),
                })
                .collect(),
        })),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("No thread for user {user_id}"))),
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Failed to list thread messages");
            Err((
                StatusCode::BAD_GATEWAY,
                format!("Failed to fetch messages: {e}"),
            ))
        }
    }
}
