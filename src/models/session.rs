//! Session-facing request and snapshot types.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Submission state of a live session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    /// No request is streaming.
    Idle,
    /// Exactly one request is streaming.
    Submitting,
}

/// Snapshot of a live session returned by the inspect operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Directory the session is bound to.
    pub working_directory: String,
    /// Last request or event touching the session.
    pub last_access_time: DateTime<Utc>,
    /// Current submission state.
    pub submission_state: SubmissionState,
    /// Last engine event observed during the current submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<DateTime<Utc>>,
    /// Submitting but silent past the stuck-warning threshold.
    ///
    /// Informational only; consumers may nudge or kill.
    pub stuck: bool,
}

/// Body of the submit operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Prompt text.
    #[serde(default)]
    pub message: String,
    /// Absolute directory the engine works in.
    #[serde(default)]
    pub working_directory: String,
    /// Session to continue, if any.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Task to append to, if any.
    #[serde(default)]
    pub task_id: Option<String>,
}

impl SubmitRequest {
    /// Reject requests missing required input.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty message or a missing or
    /// relative working directory.
    pub fn validate(&self) -> Result<()> {
        if self.message.trim().is_empty() {
            return Err(AppError::Validation("message is required".into()));
        }
        if self.working_directory.trim().is_empty() {
            return Err(AppError::Validation("workingDirectory is required".into()));
        }
        if !Path::new(&self.working_directory).is_absolute() {
            return Err(AppError::Validation(
                "workingDirectory must be an absolute path".into(),
            ));
        }
        Ok(())
    }

    /// Session id with blank values treated as absent.
    #[must_use]
    pub fn requested_session(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    /// Task id with blank values treated as absent.
    #[must_use]
    pub fn requested_task(&self) -> Option<&str> {
        self.task_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// Body of the kill operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KillRequest {
    /// Session to kill; all sessions when absent.
    #[serde(default)]
    pub session_id: Option<String>,
}
