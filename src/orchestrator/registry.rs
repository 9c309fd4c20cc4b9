//! Session registry: live sessions keyed by identifier.
//!
//! A [`Session`] binds a conversation identity to a working directory and
//! the engine it exclusively owns. Its submission state lives behind a
//! per-session mutex so that the idle-to-submitting transition is a single
//! check-and-set; [`SubmissionTicket`] is the proof of having won it.
//!
//! The registry map itself is guarded separately and is only held for
//! lookups and structural changes, never across an await point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sink::EventSink;
use crate::config::SessionIdStrategy;
use crate::engine::{Cancelable, Engine, EngineFactory};
use crate::models::event::UpdateEvent;
use crate::models::session::{SessionSummary, SubmissionState};
use crate::{AppError, Result};

/// Signal raised when a submission is stopped from outside its relay.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    fn trigger(&self, reason: &str) {
        let _ = self.reason.set(reason.to_owned());
        self.token.cancel();
    }

    /// Resolve once the submission has been stopped.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Whether the submission has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason given by whoever stopped the submission.
    #[must_use]
    pub fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| "stream stopped".to_owned())
    }
}

struct ActiveSubmission {
    generation: u64,
    started: Instant,
    cancel: Option<Arc<dyn Cancelable>>,
    sink: Option<EventSink>,
    stop: StopSignal,
}

enum Submission {
    Idle,
    Submitting(ActiveSubmission),
}

struct SessionState {
    last_access: Instant,
    last_access_time: DateTime<Utc>,
    last_event: Option<(Instant, DateTime<Utc>)>,
    generation: u64,
    submission: Submission,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_access = Instant::now();
        self.last_access_time = Utc::now();
    }
}

/// One live conversation.
pub struct Session {
    id: String,
    working_directory: PathBuf,
    engine: Arc<dyn Engine>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("working_directory", &self.working_directory)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(id: String, working_directory: PathBuf, engine: Arc<dyn Engine>) -> Self {
        Self {
            id,
            working_directory,
            engine,
            state: Mutex::new(SessionState {
                last_access: Instant::now(),
                last_access_time: Utc::now(),
                last_event: None,
                generation: 0,
                submission: Submission::Idle,
            }),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory the session is bound to.
    #[must_use]
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Engine owned by this session.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a submission is in flight.
    #[must_use]
    pub fn is_submitting(&self) -> bool {
        matches!(self.lock().submission, Submission::Submitting(_))
    }

    /// Refresh the last access time.
    pub fn touch(&self) {
        self.lock().touch();
    }

    /// Atomically move from idle to submitting.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionBusy` if a submission is already in flight.
    pub fn begin_submission(self: &Arc<Self>) -> Result<SubmissionTicket> {
        let mut state = self.lock();
        if matches!(state.submission, Submission::Submitting(_)) {
            return Err(AppError::SessionBusy(format!(
                "session {} is already submitting",
                self.id
            )));
        }

        state.generation += 1;
        let generation = state.generation;
        let stop = StopSignal::new();
        state.submission = Submission::Submitting(ActiveSubmission {
            generation,
            started: Instant::now(),
            cancel: None,
            sink: None,
            stop: stop.clone(),
        });
        state.last_event = None;
        state.touch();
        drop(state);

        debug!(session_id = %self.id, generation, "submission begun");
        Ok(SubmissionTicket {
            session: Arc::clone(self),
            generation,
            stop,
            released: false,
        })
    }

    /// Tier 1: ask the engine to stop. Best effort; a no-op when idle or
    /// when the engine is not cancelable.
    pub fn cancel_graceful(&self) -> bool {
        let handle = match &self.lock().submission {
            Submission::Submitting(active) => active.cancel.clone(),
            Submission::Idle => None,
        };
        match handle {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Tier 2: deliver a terminal `error` event to the attached sink,
    /// close it, and return the session to idle regardless of what the
    /// engine does. A no-op when idle.
    pub fn force_stop(&self, reason: &str) -> bool {
        let previous = {
            let mut state = self.lock();
            state.touch();
            std::mem::replace(&mut state.submission, Submission::Idle)
        };

        let Submission::Submitting(active) = previous else {
            return false;
        };

        if let Some(sink) = &active.sink {
            sink.terminate(&UpdateEvent::error(reason));
        }
        active.stop.trigger(reason);
        info!(session_id = %self.id, generation = active.generation, reason, "submission force-stopped");
        true
    }

    /// Record that the engine produced an event.
    pub fn observe_event(&self) {
        let mut state = self.lock();
        state.last_event = Some((Instant::now(), Utc::now()));
        state.touch();
    }

    fn release(&self, generation: u64) {
        let mut state = self.lock();
        let current = matches!(
            &state.submission,
            Submission::Submitting(active) if active.generation == generation
        );
        if current {
            state.submission = Submission::Idle;
            state.touch();
            debug!(session_id = %self.id, generation, "submission released");
        }
    }

    fn idle_for(&self) -> Duration {
        self.lock().last_access.elapsed()
    }

    /// Snapshot for the inspect operation.
    ///
    /// `stuck` is set while submitting when nothing has been observed for
    /// `stuck_after`.
    #[must_use]
    pub fn summary(&self, stuck_after: Duration) -> SessionSummary {
        let state = self.lock();
        let (submission_state, stuck) = match &state.submission {
            Submission::Idle => (SubmissionState::Idle, false),
            Submission::Submitting(active) => {
                let since = state
                    .last_event
                    .map_or(active.started, |(at, _)| at.max(active.started));
                (SubmissionState::Submitting, since.elapsed() >= stuck_after)
            }
        };

        SessionSummary {
            session_id: self.id.clone(),
            working_directory: self.working_directory.display().to_string(),
            last_access_time: state.last_access_time,
            submission_state,
            last_event_time: state.last_event.map(|(_, at)| at),
            stuck,
        }
    }
}

/// Exclusive right to run one submission on a session.
///
/// Dropping the ticket returns the session to idle unless a newer
/// submission has superseded it in the meantime.
pub struct SubmissionTicket {
    session: Arc<Session>,
    generation: u64,
    stop: StopSignal,
    released: bool,
}

impl std::fmt::Debug for SubmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionTicket")
            .field("session_id", &self.session.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl SubmissionTicket {
    /// Session this ticket belongs to.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Submission generation, unique per session.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signal raised if the submission is stopped from outside.
    #[must_use]
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Record the engine's cancel handle and the consumer's sink.
    ///
    /// Returns `false` if the submission was already stopped.
    pub fn attach(&self, cancel: Option<Arc<dyn Cancelable>>, sink: EventSink) -> bool {
        let mut state = self.session.lock();
        match &mut state.submission {
            Submission::Submitting(active) if active.generation == self.generation => {
                active.cancel = cancel;
                active.sink = Some(sink);
                true
            }
            _ => false,
        }
    }

    /// Return the session to idle. Idempotent.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.session.release(self.generation);
        }
    }
}

impl Drop for SubmissionTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// Concurrent map of live sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    factory: Arc<dyn EngineFactory>,
    ttl: Duration,
    id_strategy: SessionIdStrategy,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        ttl: Duration,
        id_strategy: SessionIdStrategy,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            ttl,
            id_strategy,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find or create the session for a request.
    ///
    /// An existing session is reused only when `requested` names it and
    /// its directory equals `working_directory` exactly. A requested id
    /// that is not live is adopted by the new session; one bound to a
    /// different directory is left alone and a fresh id is allocated.
    ///
    /// Returns the session and whether it was newly created.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        working_directory: &Path,
        initial_prompt: &str,
    ) -> (Arc<Session>, bool) {
        let mut sessions = self.lock();

        let candidate = requested.map(str::to_owned).or_else(|| {
            (self.id_strategy == SessionIdStrategy::Derived)
                .then(|| derive_session_id(working_directory, initial_prompt))
        });

        let id = match candidate {
            Some(id) => match sessions.get(&id) {
                Some(existing) if existing.working_directory == working_directory => {
                    existing.touch();
                    info!(session_id = %id, "session reused");
                    return (Arc::clone(existing), false);
                }
                Some(existing) => {
                    info!(
                        session_id = %id,
                        bound = %existing.working_directory.display(),
                        requested = %working_directory.display(),
                        "session bound to another directory, allocating a new one"
                    );
                    self.fresh_id(&sessions, working_directory, initial_prompt)
                }
                None => id,
            },
            None => self.fresh_id(&sessions, working_directory, initial_prompt),
        };

        let engine = self.factory.create(working_directory);
        let session = Arc::new(Session::new(
            id.clone(),
            working_directory.to_path_buf(),
            engine,
        ));
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session_id = %id, cwd = %working_directory.display(), "session created");
        (session, true)
    }

    fn fresh_id(
        &self,
        sessions: &HashMap<String, Arc<Session>>,
        working_directory: &Path,
        initial_prompt: &str,
    ) -> String {
        if self.id_strategy == SessionIdStrategy::Derived {
            let derived = derive_session_id(working_directory, initial_prompt);
            if !sessions.contains_key(&derived) {
                return derived;
            }
        }
        Uuid::new_v4().to_string()
    }

    /// Look up a live session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock().get(session_id).cloned()
    }

    /// Remove a session from the map without touching its submission.
    pub fn delete(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.lock().remove(session_id);
        if removed.is_some() {
            info!(session_id, "session deleted");
        }
        removed
    }

    /// Remove a session and force-stop any submission it is running.
    ///
    /// Returns whether the session existed.
    pub fn kill(&self, session_id: &str, reason: &str) -> bool {
        match self.delete(session_id) {
            Some(session) => {
                session.force_stop(reason);
                true
            }
            None => false,
        }
    }

    /// Kill every live session. Returns the ids killed.
    pub fn kill_all(&self, reason: &str) -> Vec<String> {
        let drained: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        let mut ids = Vec::with_capacity(drained.len());
        for session in drained {
            session.force_stop(reason);
            ids.push(session.id.clone());
        }
        ids.sort();
        if !ids.is_empty() {
            info!(count = ids.len(), reason, "all sessions killed");
        }
        ids
    }

    /// Evict sessions idle longer than the TTL. Returns the evicted ids.
    pub fn evict_expired(&self) -> Vec<String> {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.idle_for() >= self.ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut evicted = Vec::with_capacity(expired.len());
        for session in expired {
            if session.force_stop("session expired") {
                warn!(session_id = %session.id, "expired session was still submitting");
            }
            info!(session_id = %session.id, "session evicted");
            evicted.push(session.id.clone());
        }
        evicted
    }

    /// Snapshot all live sessions, most recently used first.
    #[must_use]
    pub fn list(&self, stuck_after: Duration) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.lock().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> =
            sessions.iter().map(|s| s.summary(stuck_after)).collect();
        summaries.sort_by(|a, b| b.last_access_time.cmp(&a.last_access_time));
        summaries
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Deterministic id for `(working_directory, initial_prompt)`.
#[must_use]
pub fn derive_session_id(working_directory: &Path, initial_prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(working_directory.as_os_str().as_encoded_bytes());
    hasher.update([0u8]);
    hasher.update(initial_prompt.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(32);
    hex
}
