//! Request-level entry points tying the orchestrator together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::builder::MessageBuilder;
use super::claims::TaskClaims;
use super::controller::SubmissionController;
use super::heartbeat::HeartbeatPolicy;
use super::registry::SessionRegistry;
use super::relay::relay;
use super::sink::{EventSink, FrameReceiver};
use crate::config::{GlobalConfig, SessionIdStrategy};
use crate::engine::EngineFactory;
use crate::models::event::UpdateEvent;
use crate::models::session::{SessionSummary, SubmitRequest};
use crate::models::task::Task;
use crate::persistence::TaskStore;
use crate::{AppError, Result};

/// Reason delivered to streams cut by an explicit kill.
pub const KILLED_REASON: &str = "session killed by request";

/// Reason delivered to streams cut by server shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// How long a superseding request waits for the displaced relay to write
/// its last checkpoint of a shared task.
const TASK_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Set when submissions must be refused for lack of a credential.
    pub missing_credential: Option<String>,
    /// Session inactivity TTL.
    pub session_ttl: Duration,
    /// Id allocation for new sessions.
    pub id_strategy: SessionIdStrategy,
    /// Delay after a forced stop.
    pub force_settle: Duration,
    /// Period of the background eviction sweep.
    pub sweep_interval: Duration,
    /// Liveness thresholds per stream.
    pub heartbeat: HeartbeatPolicy,
    /// Checkpoint cadence in events.
    pub checkpoint_every: u32,
}

impl OrchestratorSettings {
    /// Derive settings from configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            missing_credential: config.ensure_credentials().err().map(|err| match err {
                AppError::Config(msg) => msg,
                other => other.to_string(),
            }),
            session_ttl: config.session_ttl(),
            id_strategy: config.sessions.id_strategy,
            force_settle: config.force_settle(),
            sweep_interval: Duration::from_secs(config.sessions.sweep_interval_seconds),
            heartbeat: HeartbeatPolicy::from(&config.heartbeat),
            checkpoint_every: config.checkpoint.every_events,
        }
    }
}

/// An accepted submission whose events are being relayed.
#[derive(Debug)]
pub struct SubmitStream {
    /// Session in use.
    pub session_id: String,
    /// Whether the session was created for this request.
    pub is_new: bool,
    /// Task the conversation is recorded in.
    pub task_id: String,
    /// Encoded event frames, ending after the terminal event.
    pub frames: FrameReceiver,
}

/// Owner of the session registry and every relay task.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: Arc<SessionRegistry>,
    controller: SubmissionController,
    store: Arc<dyn TaskStore>,
    claims: Arc<TaskClaims>,
    relays: TaskTracker,
}

impl Orchestrator {
    /// Build an orchestrator over an engine factory and a task store.
    #[must_use]
    pub fn new(
        settings: OrchestratorSettings,
        factory: Arc<dyn EngineFactory>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            factory,
            settings.session_ttl,
            settings.id_strategy,
        ));
        let controller = SubmissionController::new(Arc::clone(&registry), settings.force_settle);
        Self {
            settings,
            registry,
            controller,
            store,
            claims: Arc::new(TaskClaims::new()),
            relays: TaskTracker::new(),
        }
    }

    /// Live session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept a submission and start relaying its events.
    ///
    /// The request and its task are checked before any session is touched,
    /// so a rejected request never disturbs a live stream.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for missing input or a completed task;
    /// - `AppError::Config` when the engine credential is missing;
    /// - `AppError::SessionBusy` when another session is writing the task;
    /// - `AppError::SessionCleared` when the engine stayed busy and the
    ///   session was deleted;
    /// - `AppError::Engine` / `AppError::Db` when the run or the initial
    ///   checkpoint cannot start.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitStream> {
        request.validate()?;
        if let Some(msg) = &self.settings.missing_credential {
            return Err(AppError::Config(msg.clone()));
        }
        if let Some(task_id) = request.requested_task() {
            self.check_task(task_id, request.requested_session()).await?;
        }

        self.registry.evict_expired();

        let working_directory = PathBuf::from(&request.working_directory);
        let (session, is_new) = self.registry.resolve(
            request.requested_session(),
            &working_directory,
            &request.message,
        );
        let task_id = request
            .requested_task()
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        let span = info_span!("submit", session_id = %session.id(), is_new, task_id = %task_id);

        async move {
            let (lease, handoff) = match self.claims.claim(&task_id, session.id()) {
                Ok(claimed) => claimed,
                Err(err) => {
                    if is_new {
                        self.registry.delete(session.id());
                    }
                    return Err(err);
                }
            };

            let ticket = self.controller.acquire(&session).await?;
            handoff.wait(&task_id, TASK_HANDOFF_TIMEOUT).await?;

            let mut builder = MessageBuilder::open(
                Arc::clone(&self.store),
                Some(&task_id),
                &request.working_directory,
                session.id(),
                &request.message,
                self.settings.checkpoint_every,
            )
            .await?
            .holding(lease);
            builder.begin().await?;

            let run = match self.controller.launch(&ticket, &request.message).await {
                Ok(run) => run,
                Err(err) => {
                    if let Err(write_err) = builder
                        .apply(&UpdateEvent::error(err.in_stream_message()))
                        .await
                    {
                        error!(%write_err, "failed to record launch failure");
                    }
                    return Err(err);
                }
            };

            let (sink, frames) = EventSink::channel();
            let relay_span = info_span!("relay", session_id = %session.id(), task_id = %task_id);
            self.relays.spawn(
                relay(ticket, run, sink, builder, self.settings.heartbeat).instrument(relay_span),
            );
            info!("submission accepted");

            Ok(SubmitStream {
                session_id: session.id().to_owned(),
                is_new,
                task_id,
                frames,
            })
        }
        .instrument(span)
        .await
    }

    /// Reject a request naming a task that cannot take it: one that has
    /// completed, or one another session is still writing.
    async fn check_task(&self, task_id: &str, session_id: Option<&str>) -> Result<()> {
        if let Some(task) = self.store.get(task_id).await? {
            task.ensure_accepts_messages()?;
        }
        self.claims.check(task_id, session_id)
    }

    /// Snapshot of all live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.registry.list(self.settings.heartbeat.stuck_warning)
    }

    /// Kill one session, or every session when `session_id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the named session is not live.
    pub fn kill(&self, session_id: Option<&str>) -> Result<Vec<String>> {
        match session_id {
            Some(id) => {
                if self.registry.kill(id, KILLED_REASON) {
                    info!(session_id = id, "session killed");
                    Ok(vec![id.to_owned()])
                } else {
                    Err(AppError::NotFound(format!("session {id} not found")))
                }
            }
            None => Ok(self.registry.kill_all(KILLED_REASON)),
        }
    }

    /// Read the authoritative stored task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such task exists.
    pub async fn task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))
    }

    /// Periodically evict expired sessions until `cancel` fires.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(this.settings.sweep_interval);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("session sweeper shutting down");
                            break;
                        }
                        _ = interval.tick() => {
                            let evicted = this.registry.evict_expired();
                            if !evicted.is_empty() {
                                info!(count = evicted.len(), "expired sessions evicted");
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("session_sweeper")),
        )
    }

    /// Kill every session and wait up to `grace` for relays to checkpoint.
    pub async fn shutdown(&self, grace: Duration) {
        let killed = self.registry.kill_all(SHUTDOWN_REASON);
        self.relays.close();
        if tokio::time::timeout(grace, self.relays.wait()).await.is_err() {
            warn!(pending = self.relays.len(), "relays still running at shutdown");
        }
        info!(sessions = killed.len(), "orchestrator shut down");
    }
}
