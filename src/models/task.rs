//! Durable conversation record and its messages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::event::ToolResult;
use crate::{AppError, Result};

/// Lifecycle status for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no submission yet.
    Pending,
    /// A submission is streaming into the task.
    Running,
    /// The last submission finished normally.
    Completed,
    /// The last submission ended in an error.
    Failed,
}

impl TaskStatus {
    /// Lower-case storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Prompt sent by the user.
    User,
    /// Output folded from the engine stream.
    Assistant,
}

/// One tool invocation inside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// Tool name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Tool arguments.
    pub args: Value,
    /// Set once the matching completion arrives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// When the start event was folded.
    pub start_time: DateTime<Utc>,
    /// When the completion event was folded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Structured side-channel data of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Accumulated reasoning text.
    #[serde(default)]
    pub thinking: String,
    /// Tool calls keyed by call id.
    #[serde(default)]
    pub tool_calls: BTreeMap<String, ToolCallRecord>,
    /// Progress summaries in arrival order.
    #[serde(default)]
    pub summaries: Vec<String>,
    /// Time of the last folded event.
    pub last_update_time: DateTime<Utc>,
}

/// A single message of a task conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique message identifier.
    pub id: String,
    /// Message author.
    pub role: Role,
    /// Accumulated text content.
    pub content: String,
    is_streaming: bool,
    /// Reasoning, tool calls and summaries.
    pub metadata: MessageMetadata,
}

impl ChatMessage {
    /// A finished user prompt.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::build(Role::User, content.into(), false)
    }

    /// An empty assistant message that is still receiving events.
    #[must_use]
    pub fn streaming_assistant() -> Self {
        Self::build(Role::Assistant, String::new(), true)
    }

    fn build(role: Role, content: String, is_streaming: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            is_streaming,
            metadata: MessageMetadata {
                thinking: String::new(),
                tool_calls: BTreeMap::new(),
                summaries: Vec::new(),
                last_update_time: Utc::now(),
            },
        }
    }

    /// Whether the message still accepts events.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    /// Stop streaming. There is no way back.
    pub fn finalize(&mut self) {
        self.is_streaming = false;
    }

    /// Advance `last_update_time`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.metadata.last_update_time {
            self.metadata.last_update_time = now;
        }
    }
}

/// Durable conversation record owned by the task store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Working directory the conversation runs against.
    pub repo_path: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Session that last streamed into this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Running token total.
    #[serde(default)]
    pub token_count: u64,
    /// Time of the last folded event.
    pub last_activity_time: DateTime<Utc>,
    /// Failure text of the last submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Conversation messages in order.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Task {
    /// Construct a pending task with the given identifier.
    #[must_use]
    pub fn new(id: Option<String>, repo_path: String) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            repo_path,
            status: TaskStatus::Pending,
            session_id: None,
            token_count: 0,
            last_activity_time: Utc::now(),
            error: None,
            messages: Vec::new(),
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Status only moves forward, except that a failed task may be retried
    /// and a `running` task may be taken over. The status alone cannot tell
    /// a lost stream from a live one; live writers hold a task claim.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self.status, next),
            (
                TaskStatus::Pending | TaskStatus::Failed | TaskStatus::Running,
                TaskStatus::Running
            ) | (
                TaskStatus::Running,
                TaskStatus::Completed | TaskStatus::Failed
            )
        )
    }

    /// Fail unless a new exchange may be appended to the task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the task has completed.
    pub fn ensure_accepts_messages(&self) -> Result<()> {
        if self.can_transition_to(TaskStatus::Running) {
            return Ok(());
        }
        Err(AppError::Validation(format!(
            "task {} is {} and cannot accept new messages",
            self.id,
            self.status.as_str()
        )))
    }

    /// The assistant message currently receiving events, if any.
    #[must_use]
    pub fn streaming_message_mut(&mut self) -> Option<&mut ChatMessage> {
        self.messages
            .last_mut()
            .filter(|message| message.is_streaming())
    }

    /// Finalize any message a lost stream left open.
    pub fn close_dangling_messages(&mut self) {
        for message in &mut self.messages {
            message.finalize();
        }
    }
}
