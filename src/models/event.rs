//! Update events produced by the engine and relayed to the client.
//!
//! [`UpdateEvent`] is a closed tagged union: the `type` field selects the
//! variant and unknown tags are rejected with [`AppError::Serialization`]
//! rather than skipped. The same JSON shape is used on the engine side
//! (NDJSON lines) and on the wire (`data: <json>\n\n` frames).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Outcome classification carried by a completed tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    /// The tool finished normally.
    Success,
    /// The tool reported a failure.
    Error,
}

/// Result attached to a completed tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Success or failure.
    pub status: ToolResultStatus,
    /// Tool output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tool invocation payload attached to tool-call events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool name (`read`, `edit`, `shell`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Tool arguments as given by the engine.
    #[serde(default)]
    pub args: Value,
    /// Present on completion events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

/// One event in a session's update stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum UpdateEvent {
    /// Identifies the session the stream belongs to; always first on the wire.
    Session {
        /// Session identifier in use.
        session_id: String,
    },
    /// Assistant text fragment.
    TextDelta {
        /// Appended text.
        text: String,
    },
    /// Reasoning text fragment.
    ThinkingDelta {
        /// Appended reasoning text.
        text: String,
    },
    /// Reasoning phase finished.
    ThinkingCompleted {
        /// Time spent reasoning.
        duration_ms: u64,
    },
    /// A tool invocation began.
    ToolCallStarted {
        /// Correlates the matching completion.
        call_id: String,
        /// Invocation payload.
        tool_call: ToolCall,
    },
    /// A tool invocation finished.
    ToolCallCompleted {
        /// Correlates the earlier start.
        call_id: String,
        /// Invocation payload including its result.
        tool_call: ToolCall,
    },
    /// Progress summary line.
    Summary {
        /// Summary text.
        text: String,
    },
    /// Token usage increment.
    TokenDelta {
        /// Tokens consumed since the previous delta.
        tokens: u64,
    },
    /// Terminal failure, explained in plain language.
    Error {
        /// Human-readable cause.
        text: String,
    },
    /// Terminal success.
    Done,
}

impl UpdateEvent {
    /// Decode one engine line into an event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` for malformed JSON, missing fields,
    /// or an unknown `type` tag.
    pub fn from_json(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|err| AppError::Serialization(format!("undecodable event: {err}")))
    }

    /// Encode the event as the JSON body of a wire frame.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if the payload cannot be encoded.
    pub fn to_wire_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(AppError::from)
    }

    /// Build an in-band error event.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    /// Whether the event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done)
    }

    /// Wire tag of the variant, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::TextDelta { .. } => "text-delta",
            Self::ThinkingDelta { .. } => "thinking-delta",
            Self::ThinkingCompleted { .. } => "thinking-completed",
            Self::ToolCallStarted { .. } => "tool-call-started",
            Self::ToolCallCompleted { .. } => "tool-call-completed",
            Self::Summary { .. } => "summary",
            Self::TokenDelta { .. } => "token-delta",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}
