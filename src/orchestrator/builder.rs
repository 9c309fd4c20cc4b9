//! Incremental message builder and checkpoint writer.
//!
//! Folds the update-event sequence of one submission into the active
//! [`Task`]: the user prompt plus a streaming assistant message that is
//! mutated in place until a terminal event finalizes it. The builder is
//! the only writer of task records; it holds the task's lease while it
//! lives.
//!
//! Checkpoint policy: the full task is upserted every `every_events`
//! folded events, and additionally on `tool-call-completed`, `summary`,
//! `error` and `done`. A crash therefore loses at most `every_events - 1`
//! events of content.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::claims::TaskLease;
use crate::models::event::UpdateEvent;
use crate::models::task::{ChatMessage, Task, TaskStatus, ToolCallRecord};
use crate::persistence::TaskStore;
use crate::Result;

/// Accumulates one submission into a task and checkpoints it.
pub struct MessageBuilder {
    store: Arc<dyn TaskStore>,
    task: Task,
    every: u32,
    since_checkpoint: u32,
    finished: bool,
    lease: Option<TaskLease>,
}

impl MessageBuilder {
    /// Load (or create) the task and append the new exchange.
    ///
    /// Any message a previous, abandoned stream left open is finalized
    /// first. Nothing is written until [`begin`](Self::begin).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the task has already completed,
    /// or `AppError::Db` if it cannot be loaded.
    pub async fn open(
        store: Arc<dyn TaskStore>,
        task_id: Option<&str>,
        repo_path: &str,
        session_id: &str,
        prompt: &str,
        every: u32,
    ) -> Result<Self> {
        let existing = match task_id {
            Some(id) => store.get(id).await?,
            None => None,
        };
        let mut task = existing.unwrap_or_else(|| {
            Task::new(task_id.map(str::to_owned), repo_path.to_owned())
        });

        task.ensure_accepts_messages()?;

        task.close_dangling_messages();
        task.status = TaskStatus::Running;
        task.error = None;
        task.session_id = Some(session_id.to_owned());
        task.messages.push(ChatMessage::user(prompt));
        task.messages.push(ChatMessage::streaming_assistant());
        task.last_activity_time = task.last_activity_time.max(Utc::now());

        Ok(Self {
            store,
            task,
            every: every.max(1),
            since_checkpoint: 0,
            finished: false,
            lease: None,
        })
    }

    /// Keep `lease` for as long as this builder lives.
    #[must_use]
    pub fn holding(mut self, lease: TaskLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Persist the opened task so the exchange is visible before any event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn begin(&mut self) -> Result<()> {
        self.checkpoint().await
    }

    /// Fold one event and checkpoint if the policy requires it.
    ///
    /// Events arriving after a terminal event are ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a due checkpoint cannot be written. The
    /// fold itself is kept; the next checkpoint retries the write.
    pub async fn apply(&mut self, event: &UpdateEvent) -> Result<()> {
        if self.finished {
            debug!(kind = event.kind(), "event after finalization ignored");
            return Ok(());
        }

        let forced = self.fold(event, Utc::now());
        self.since_checkpoint += 1;

        if forced || self.since_checkpoint >= self.every {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Whether a terminal event has been folded.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Current in-memory task.
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Apply `event` to the in-memory record. Returns whether the event
    /// forces a checkpoint.
    fn fold(&mut self, event: &UpdateEvent, now: DateTime<Utc>) -> bool {
        if now > self.task.last_activity_time {
            self.task.last_activity_time = now;
        }

        match event {
            UpdateEvent::Session { session_id } => {
                self.task.session_id = Some(session_id.clone());
                false
            }
            UpdateEvent::TokenDelta { tokens } => {
                self.task.token_count = self.task.token_count.saturating_add(*tokens);
                false
            }
            UpdateEvent::Error { text } => {
                if self.task.can_transition_to(TaskStatus::Failed) {
                    self.task.status = TaskStatus::Failed;
                }
                self.task.error = Some(text.clone());
                self.finish(now);
                true
            }
            UpdateEvent::Done => {
                if self.task.can_transition_to(TaskStatus::Completed) {
                    self.task.status = TaskStatus::Completed;
                }
                self.finish(now);
                true
            }
            other => self.fold_into_message(other, now),
        }
    }

    fn fold_into_message(&mut self, event: &UpdateEvent, now: DateTime<Utc>) -> bool {
        let Some(message) = self.task.streaming_message_mut() else {
            return false;
        };
        message.touch(now);
        let meta = &mut message.metadata;

        match event {
            UpdateEvent::ThinkingDelta { text } => {
                meta.thinking.push_str(text);
                false
            }
            UpdateEvent::ThinkingCompleted { duration_ms } => {
                meta.thinking
                    .push_str(&format!("\n[thinking completed in {duration_ms}ms]\n"));
                false
            }
            UpdateEvent::TextDelta { text } => {
                message.content.push_str(text);
                false
            }
            UpdateEvent::ToolCallStarted { call_id, tool_call } => {
                meta.tool_calls.insert(
                    call_id.clone(),
                    ToolCallRecord {
                        kind: tool_call.kind.clone(),
                        args: tool_call.args.clone(),
                        result: None,
                        start_time: now,
                        end_time: None,
                    },
                );
                false
            }
            UpdateEvent::ToolCallCompleted { call_id, tool_call } => {
                match meta.tool_calls.get_mut(call_id) {
                    Some(record) => {
                        record.result.clone_from(&tool_call.result);
                        record.end_time = Some(now);
                    }
                    None => warn!(call_id, "tool completion without a matching start dropped"),
                }
                true
            }
            UpdateEvent::Summary { text } => {
                meta.summaries.push(text.clone());
                true
            }
            UpdateEvent::Session { .. }
            | UpdateEvent::TokenDelta { .. }
            | UpdateEvent::Error { .. }
            | UpdateEvent::Done => false,
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        if let Some(message) = self.task.streaming_message_mut() {
            message.touch(now);
            message.finalize();
        }
        self.finished = true;
    }

    async fn checkpoint(&mut self) -> Result<()> {
        self.store.upsert(&self.task).await?;
        self.since_checkpoint = 0;
        debug!(
            task_id = %self.task.id,
            status = self.task.status.as_str(),
            leased = self.lease.is_some(),
            "checkpoint written"
        );
        Ok(())
    }
}
