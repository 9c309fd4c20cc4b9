//! Local IPC layer for `session-relay-ctl`.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands from the companion CLI.

pub mod server;

/// File name, inside the data directory, holding the per-instance IPC token.
pub const TOKEN_FILE_NAME: &str = "ipc.token";
