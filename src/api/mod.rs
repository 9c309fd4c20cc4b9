//! HTTP transport: submit, inspect, kill, task projection, health.
//!
//! | Route | Response |
//! |---|---|
//! | `POST /api/submit` | `text/event-stream` of `data: <json>` frames |
//! | `GET /api/sessions` | `{"sessions": [...]}` |
//! | `POST /api/kill` | `{"killed": [...]}` |
//! | `GET /api/tasks/{id}` | stored task |
//! | `GET /health` | `ok` |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::session::{KillRequest, SubmitRequest};
use crate::models::task::Task;
use crate::orchestrator::sink::FrameReceiver;
use crate::state::AppState;
use crate::{AppError, Result};

/// Header carrying the task id of an accepted submission.
pub const TASK_ID_HEADER: &str = "x-task-id";

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SessionBusy(_) | Self::SessionCleared(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            Self::SessionBusy(msg) => json!({ "error": msg, "sessionCleared": false }),
            Self::SessionCleared(msg) => json!({ "error": msg, "sessionCleared": true }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/submit", post(submit))
        .route("/api/sessions", get(sessions))
        .route("/api/kill", post(kill))
        .route("/api/tasks/{id}", get(task))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn submit(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    let request: SubmitRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::Validation(format!("invalid submit request: {err}")))?;
    let accepted = state.orchestrator.submit(request).await?;
    let task_id = HeaderValue::from_str(&accepted.task_id).ok();

    let mut response = Sse::new(frame_stream(accepted.frames)).into_response();
    if let Some(value) = task_id {
        response.headers_mut().insert(TASK_ID_HEADER, value);
    }
    Ok(response)
}

fn frame_stream(
    frames: FrameReceiver,
) -> impl futures_util::Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(frames, |mut frames| async move {
        let frame = frames.recv().await?;
        Some((Ok(Event::default().data(frame)), frames))
    })
}

async fn sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.orchestrator.sessions() }))
}

async fn kill(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let request: KillRequest = if body.iter().all(u8::is_ascii_whitespace) {
        KillRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::Validation(format!("invalid kill request: {err}")))?
    };
    let target = request
        .session_id
        .as_deref()
        .filter(|id| !id.trim().is_empty());
    let killed = state.orchestrator.kill(target)?;
    Ok(Json(json!({ "killed": killed })))
}

async fn task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Task>> {
    Ok(Json(state.orchestrator.task(&id).await?))
}

/// Serve the HTTP transport on `127.0.0.1:http_port` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind, or
/// `AppError::Io` if the server fails.
pub async fn serve_http(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.http_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "starting HTTP transport");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("HTTP transport shut down");
    Ok(())
}
