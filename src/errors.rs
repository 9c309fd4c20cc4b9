//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Required request input is missing or malformed.
    Validation(String),
    /// Configuration parsing, validation, or credential failure.
    Config(String),
    /// The session (or its engine) is still running a previous submission.
    SessionBusy(String),
    /// The session was deleted to break a deadlock; retry with a new session id.
    SessionCleared(String),
    /// The stream exceeded its wall-clock budget.
    StreamTimeout(String),
    /// The stream produced no events for longer than the inactivity limit.
    StreamHung(String),
    /// A single event could not be encoded or decoded.
    Serialization(String),
    /// The engine transport failed (connection drop, process I/O, spawn).
    Engine(String),
    /// Persistence failure when interacting with the task store.
    Db(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Plain-language text delivered inside an in-band `error` event.
    #[must_use]
    pub fn in_stream_message(&self) -> String {
        match self {
            Self::StreamTimeout(msg) => format!("stream timed out: {msg}"),
            Self::StreamHung(msg) => format!("stream hung: {msg}"),
            Self::Engine(msg) | Self::Io(msg) => format!("connection lost: {msg}"),
            Self::Serialization(msg) => format!("event could not be delivered: {msg}"),
            Self::SessionBusy(msg) | Self::SessionCleared(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the error ends the stream when it surfaces mid-flight.
    ///
    /// Only per-event serialization failures are survivable.
    #[must_use]
    pub fn is_fatal_in_stream(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::SessionBusy(msg) => write!(f, "session busy: {msg}"),
            Self::SessionCleared(msg) => write!(f, "session cleared: {msg}"),
            Self::StreamTimeout(msg) => write!(f, "stream timeout: {msg}"),
            Self::StreamHung(msg) => write!(f, "stream hung: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::Engine(msg) => write!(f, "engine: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
