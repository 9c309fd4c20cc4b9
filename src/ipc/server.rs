//! Local IPC server for `session-relay-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list", "auth_token": "..."}
//! {"command": "kill", "id": "session-123", "auth_token": "..."}
//! {"command": "kill", "auth_token": "..."}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: session abc not found"}
//! ```

use std::path::Path;
use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::state::AppState;
use crate::{AppError, Result};

/// Inbound IPC request from `session-relay-ctl`.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Session identifier (for `kill`).
    id: Option<String>,
    /// Shared-secret authentication token.
    auth_token: Option<String>,
}

/// Outbound IPC response to `session-relay-ctl`.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Write the auth token where the companion CLI can read it.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be written.
pub fn write_token_file(path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Io(format!("failed to create token dir: {err}")))?;
    }
    std::fs::write(path, token)
        .map_err(|err| AppError::Io(format!("failed to write ipc token: {err}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|err| AppError::Io(format!("failed to restrict ipc token: {err}")))?;
    }
    Ok(())
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<AppState>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state),
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the appropriate handler.
fn dispatch_command(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let _guard = info_span!("ipc_command", command = %request.command).entered();

    if let Some(ref expected) = state.ipc_auth_token {
        match request.auth_token {
            Some(ref provided) if provided == expected => {}
            _ => {
                warn!(command = %request.command, "IPC request rejected: invalid auth token");
                return IpcResponse::error("unauthorized");
            }
        }
    }

    match request.command.as_str() {
        "list" => handle_list(state),
        "kill" => handle_kill(request, state),
        other => IpcResponse::error(format!("unknown command: {other}")),
    }
}

fn handle_list(state: &AppState) -> IpcResponse {
    match serde_json::to_value(state.orchestrator.sessions()) {
        Ok(sessions) => IpcResponse::success(serde_json::json!({ "sessions": sessions })),
        Err(err) => IpcResponse::error(format!("failed to encode sessions: {err}")),
    }
}

fn handle_kill(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let target = request.id.as_deref().filter(|id| !id.trim().is_empty());
    match state.orchestrator.kill(target) {
        Ok(killed) => {
            info!(count = killed.len(), "sessions killed via IPC");
            IpcResponse::success(serde_json::json!({ "killed": killed }))
        }
        Err(err) => IpcResponse::error(err.to_string()),
    }
}
