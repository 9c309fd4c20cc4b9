//! Submission concurrency controller.
//!
//! Enforces single-flight per session and owns the cancellation ladder
//! used when a request arrives for a session that is still submitting:
//!
//! 1. graceful: invoke the engine's cancel handle, best effort;
//! 2. forced: terminate the attached sink with an `error` event, clear the
//!    submission, and wait a short settle delay;
//! 3. nuclear: if the engine still reports busy when the new submission
//!    is launched, delete the session and tell the caller to retry with a
//!    new session id.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::registry::{Session, SessionRegistry, SubmissionTicket};
use crate::engine::EngineRun;
use crate::{AppError, Result};

/// Reason delivered to a stream displaced by a newer request.
pub const SUPERSEDED_REASON: &str = "superseded by a new request";

/// Single-flight gate in front of each session's engine.
pub struct SubmissionController {
    registry: Arc<SessionRegistry>,
    settle: Duration,
}

impl SubmissionController {
    /// Create a controller over `registry`.
    ///
    /// `settle` is observed after a forced stop before the session is reused.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, settle: Duration) -> Self {
        Self { registry, settle }
    }

    /// Obtain the submission ticket for `session`, displacing any submission
    /// already in flight.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionBusy` if another request claimed the session
    /// during the settle delay.
    pub async fn acquire(&self, session: &Arc<Session>) -> Result<SubmissionTicket> {
        match session.begin_submission() {
            Ok(ticket) => return Ok(ticket),
            Err(AppError::SessionBusy(_)) => {}
            Err(err) => return Err(err),
        }

        let session_id = session.id();
        warn!(session_id, "session busy, cancelling in-flight submission");
        if !session.cancel_graceful() {
            warn!(session_id, "in-flight submission is not cancelable");
        }

        warn!(session_id, "forcing in-flight submission closed");
        session.force_stop(SUPERSEDED_REASON);
        tokio::time::sleep(self.settle).await;

        session.begin_submission()
    }

    /// Start the engine for a held ticket.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionCleared` after deleting the session if the
    /// engine still reports busy, or the engine's own error otherwise.
    pub async fn launch(&self, ticket: &SubmissionTicket, prompt: &str) -> Result<EngineRun> {
        let session = ticket.session();
        match session
            .engine()
            .submit(prompt, session.working_directory())
            .await
        {
            Ok(run) => Ok(run),
            Err(AppError::SessionBusy(msg)) => {
                warn!(
                    session_id = session.id(),
                    %msg,
                    "engine still busy after forced cleanup, deleting session"
                );
                self.registry.delete(session.id());
                info!(session_id = session.id(), "session cleared");
                Err(AppError::SessionCleared(format!(
                    "session {} was reset because its engine stayed busy; retry with a new session id",
                    session.id()
                )))
            }
            Err(err) => Err(err),
        }
    }
}
