//! Task write claims.
//!
//! Each task record has at most one writer: the relay of the submission
//! that holds its [`TaskLease`]. A session may take over a task it already
//! owns (its previous submission is being superseded); any other session
//! is refused until the owner lets go.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

#[derive(Clone)]
struct Claim {
    session_id: String,
    serial: u64,
    released: CancellationToken,
}

/// Table of tasks currently owned by a live submission.
#[derive(Default)]
pub struct TaskClaims {
    claims: Mutex<HashMap<String, Claim>>,
    serial: AtomicU64,
}

impl TaskClaims {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Claim>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session currently writing `task_id`, if any.
    #[must_use]
    pub fn owner(&self, task_id: &str) -> Option<String> {
        self.lock().get(task_id).map(|claim| claim.session_id.clone())
    }

    /// Fail unless `session_id` may write `task_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionBusy` if another session owns the task.
    pub fn check(&self, task_id: &str, session_id: Option<&str>) -> Result<()> {
        match self.owner(task_id) {
            Some(owner) if Some(owner.as_str()) != session_id => Err(busy(task_id, &owner)),
            _ => Ok(()),
        }
    }

    /// Take ownership of `task_id` for `session_id`.
    ///
    /// A claim already held by the same session is replaced; the returned
    /// [`Handoff`] resolves once the displaced lease is dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionBusy` if another session owns the task.
    pub fn claim(self: &Arc<Self>, task_id: &str, session_id: &str) -> Result<(TaskLease, Handoff)> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        let released = CancellationToken::new();

        let mut claims = self.lock();
        let displaced = match claims.get(task_id) {
            Some(claim) if claim.session_id != session_id => {
                return Err(busy(task_id, &claim.session_id));
            }
            other => other.cloned(),
        };
        claims.insert(
            task_id.to_owned(),
            Claim {
                session_id: session_id.to_owned(),
                serial,
                released: released.clone(),
            },
        );
        drop(claims);

        debug!(task_id, session_id, serial, "task claimed");
        let handoff = Handoff(displaced.as_ref().map(|claim| claim.released.clone()));
        Ok((
            TaskLease {
                claims: Arc::clone(self),
                task_id: task_id.to_owned(),
                serial,
                released,
                displaced,
            },
            handoff,
        ))
    }

    /// Drop the claim `serial` holds, handing the task back to the claim
    /// it displaced if that writer has not finished yet.
    fn release(&self, task_id: &str, serial: u64, displaced: Option<Claim>) {
        let mut claims = self.lock();
        if !claims.get(task_id).is_some_and(|claim| claim.serial == serial) {
            return;
        }
        match displaced {
            Some(claim) if !claim.released.is_cancelled() => {
                claims.insert(task_id.to_owned(), claim);
            }
            _ => {
                claims.remove(task_id);
            }
        }
    }
}

fn busy(task_id: &str, owner: &str) -> AppError {
    AppError::SessionBusy(format!(
        "task {task_id} is being written by session {owner}"
    ))
}

/// Pending release of a displaced lease on the same task.
#[derive(Debug)]
pub struct Handoff(Option<CancellationToken>);

impl Handoff {
    /// Wait until the previous writer has let go of the task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionBusy` if it still holds the task after
    /// `timeout`.
    pub async fn wait(self, task_id: &str, timeout: Duration) -> Result<()> {
        let Some(previous) = self.0 else {
            return Ok(());
        };
        if tokio::time::timeout(timeout, previous.cancelled()).await.is_err() {
            warn!(task_id, "previous writer did not release the task in time");
            return Err(AppError::SessionBusy(format!(
                "task {task_id} is still being written by a stopped stream"
            )));
        }
        Ok(())
    }
}

/// Exclusive right to write one task. Released on drop.
pub struct TaskLease {
    claims: Arc<TaskClaims>,
    task_id: String,
    serial: u64,
    released: CancellationToken,
    displaced: Option<Claim>,
}

impl std::fmt::Debug for TaskLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLease")
            .field("task_id", &self.task_id)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl TaskLease {
    /// Task this lease covers.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        self.claims
            .release(&self.task_id, self.serial, self.displaced.take());
        self.released.cancel();
        debug!(task_id = %self.task_id, serial = self.serial, "task released");
    }
}
