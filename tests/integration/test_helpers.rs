//! Shared test helpers for orchestrator-level integration tests.
//!
//! Provides a scripted engine, a store that records every checkpoint,
//! millisecond-scale settings, and frame collection so individual test
//! modules can focus on behaviour rather than boilerplate.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use session_relay::config::SessionIdStrategy;
use session_relay::engine::{Cancelable, Engine, EngineFactory, EngineRun};
use session_relay::models::event::{ToolCall, ToolResult, ToolResultStatus, UpdateEvent};
use session_relay::models::task::Task;
use session_relay::orchestrator::heartbeat::HeartbeatPolicy;
use session_relay::orchestrator::{Orchestrator, OrchestratorSettings, SubmitStream};
use session_relay::persistence::task_store::MemoryTaskStore;
use session_relay::persistence::{StoreFuture, TaskStore};
use session_relay::{AppError, Result};

/// One step of a scripted engine run.
#[derive(Debug, Clone)]
pub enum Step {
    /// Yield an event.
    Event(UpdateEvent),
    /// Yield an error item.
    Fail(AppError),
    /// Sleep before the next step.
    Pause(Duration),
    /// Produce nothing until cancelled.
    Hang,
}

/// Engine that replays queued scripts, one per submission.
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    busy: AtomicBool,
    submissions: AtomicUsize,
    cancels: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the script for the next submission.
    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    /// Make every later submission report busy.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

struct ScriptedCancel {
    token: CancellationToken,
    count: Arc<AtomicUsize>,
}

impl Cancelable for ScriptedCancel {
    fn cancel(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
    }
}

impl Engine for ScriptedEngine {
    fn submit(
        &self,
        _prompt: &str,
        _working_directory: &Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<EngineRun>> + Send + '_>> {
        Box::pin(async move {
            if self.busy.load(Ordering::SeqCst) {
                return Err(AppError::SessionBusy("engine busy".into()));
            }
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

            let token = CancellationToken::new();
            let (tx, rx) = mpsc::channel(16);
            let feeder_token = token.clone();
            tokio::spawn(async move {
                for step in steps {
                    let item = match step {
                        Step::Event(event) => Ok(event),
                        Step::Fail(err) => Err(err),
                        Step::Pause(delay) => {
                            tokio::select! {
                                () = feeder_token.cancelled() => return,
                                () = tokio::time::sleep(delay) => continue,
                            }
                        }
                        Step::Hang => {
                            feeder_token.cancelled().await;
                            return;
                        }
                    };
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            });

            let events = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed();

            Ok(EngineRun {
                events,
                cancel: Some(Arc::new(ScriptedCancel {
                    token,
                    count: Arc::clone(&self.cancels),
                })),
            })
        })
    }
}

/// Factory handing the same scripted engine to every session.
pub struct ScriptedFactory(pub Arc<ScriptedEngine>);

impl EngineFactory for ScriptedFactory {
    fn create(&self, _working_directory: &Path) -> Arc<dyn Engine> {
        Arc::clone(&self.0) as Arc<dyn Engine>
    }
}

/// Task store that keeps a copy of every upsert.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryTaskStore,
    writes: Mutex<Vec<Task>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<Task> {
        self.writes.lock().unwrap().clone()
    }
}

impl TaskStore for RecordingStore {
    fn get<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, Option<Task>> {
        self.inner.get(task_id)
    }

    fn upsert<'a>(&'a self, task: &'a Task) -> StoreFuture<'a, ()> {
        self.writes.lock().unwrap().push(task.clone());
        self.inner.upsert(task)
    }

    fn delete<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, ()> {
        self.inner.delete(task_id)
    }
}

/// Settings with millisecond heartbeat thresholds.
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        missing_credential: None,
        session_ttl: Duration::from_secs(60),
        id_strategy: SessionIdStrategy::Random,
        force_settle: Duration::from_millis(100),
        sweep_interval: Duration::from_secs(60),
        heartbeat: HeartbeatPolicy {
            hard_timeout: Duration::from_secs(5),
            check_interval: Duration::from_millis(20),
            warn_after: Duration::from_millis(60),
            kill_after: Duration::from_millis(250),
            stuck_warning: Duration::from_millis(50),
        },
        checkpoint_every: 10,
    }
}

/// Orchestrator over a scripted engine and a recording store.
pub fn test_orchestrator(
    settings: OrchestratorSettings,
) -> (Arc<Orchestrator>, Arc<ScriptedEngine>, Arc<RecordingStore>) {
    let engine = ScriptedEngine::new();
    let store = RecordingStore::new();
    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(ScriptedFactory(Arc::clone(&engine))),
        Arc::clone(&store) as Arc<dyn TaskStore>,
    );
    (Arc::new(orchestrator), engine, store)
}

/// Drain a stream until it closes, decoding every frame.
pub async fn collect_events(stream: SubmitStream) -> Vec<UpdateEvent> {
    collect_frames(stream)
        .await
        .iter()
        .map(|frame| UpdateEvent::from_json(frame).expect("frame decodes"))
        .collect()
}

/// Drain a stream until it closes.
pub async fn collect_frames(mut stream: SubmitStream) -> Vec<String> {
    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.frames.recv()).await {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => return frames,
            Err(_) => panic!("stream did not close; got {frames:?}"),
        }
    }
}

/// Wait until `check` holds, polling every 10ms for up to 2s.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn text(s: &str) -> Step {
    Step::Event(UpdateEvent::TextDelta { text: s.into() })
}

pub fn tool_started(call_id: &str) -> Step {
    Step::Event(UpdateEvent::ToolCallStarted {
        call_id: call_id.into(),
        tool_call: ToolCall {
            kind: "read".into(),
            args: serde_json::json!({ "path": "src/lib.rs" }),
            result: None,
        },
    })
}

pub fn tool_completed(call_id: &str) -> Step {
    Step::Event(UpdateEvent::ToolCallCompleted {
        call_id: call_id.into(),
        tool_call: ToolCall {
            kind: "read".into(),
            args: serde_json::json!({ "path": "src/lib.rs" }),
            result: Some(ToolResult {
                status: ToolResultStatus::Success,
                value: Some(serde_json::json!("fn main() {}")),
                error: None,
            }),
        },
    })
}

pub fn done() -> Step {
    Step::Event(UpdateEvent::Done)
}
