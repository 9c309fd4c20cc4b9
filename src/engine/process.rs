//! Child-process engine adapter.
//!
//! Launches the configured host CLI once per submission with:
//! - the working directory as `cwd` and the prompt as the final argument;
//! - `env_clear()` + a safe variable allowlist, plus the engine credential
//!   under its configured variable name;
//! - `kill_on_drop(true)` so an abandoned run never outlives its session.
//!
//! Stdout is read as NDJSON through [`EventLineCodec`]. A supervisor task
//! owns the child, forwards decoded events, reaps the process and clears
//! the engine's running flag. Until that flag clears, further submissions
//! are refused with [`AppError::SessionBusy`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::EventLineCodec;
use super::{Cancelable, Engine, EngineFactory, EngineRun};
use crate::config::EngineConfig;
use crate::models::event::UpdateEvent;
use crate::{AppError, Result};

/// Environment variables inherited by the engine process.
///
/// Everything else in the server's environment is stripped.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "RUST_LOG",
    "TMPDIR",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

const EVENT_BUFFER: usize = 64;

/// Launch parameters shared by every engine the factory creates.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Binary to execute.
    pub host_cli: String,
    /// Arguments placed before the prompt.
    pub host_cli_args: Vec<String>,
    /// Credential variable name and value injected into the child.
    pub credential: Option<(String, String)>,
    /// Delay between the interrupt signal and a hard kill.
    pub cancel_grace: Duration,
}

impl ProcessSpec {
    /// Derive launch parameters from engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            host_cli: config.host_cli.clone(),
            host_cli_args: config.host_cli_args.clone(),
            credential: config
                .credential
                .clone()
                .map(|value| (config.credential_env.clone(), value)),
            cancel_grace: Duration::from_millis(config.cancel_grace_millis),
        }
    }
}

/// Factory producing one [`ProcessEngine`] per session.
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    spec: Arc<ProcessSpec>,
}

impl ProcessEngineFactory {
    /// Create a factory for the given launch parameters.
    #[must_use]
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec: Arc::new(spec),
        }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, working_directory: &Path) -> Arc<dyn Engine> {
        Arc::new(ProcessEngine {
            spec: Arc::clone(&self.spec),
            working_directory: working_directory.to_path_buf(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Engine that runs one child process per submission.
#[derive(Debug)]
pub struct ProcessEngine {
    spec: Arc<ProcessSpec>,
    working_directory: PathBuf,
    running: Arc<AtomicBool>,
}

impl ProcessEngine {
    /// Whether a previous child is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn(&self, prompt: &str, working_directory: &Path) -> Result<EngineRun> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::SessionBusy(
                "engine is still running a previous request".into(),
            ));
        }

        match self.launch(prompt, working_directory) {
            Ok(run) => Ok(run),
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn launch(&self, prompt: &str, working_directory: &Path) -> Result<EngineRun> {
        let mut cmd = Command::new(&self.spec.host_cli);
        cmd.args(&self.spec.host_cli_args).arg(prompt);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        if let Some((ref key, ref value)) = self.spec.credential {
            cmd.env(key, value);
        }

        cmd.current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Engine(format!("failed to spawn engine: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Engine("failed to capture engine stdout".into()))?;
        let stderr = child.stderr.take();

        info!(
            pid = child.id(),
            cwd = %working_directory.display(),
            "engine process started"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(
            supervise(
                child,
                stdout,
                stderr,
                tx,
                cancel.clone(),
                self.spec.cancel_grace,
                Arc::clone(&self.running),
            )
            .instrument(info_span!("engine_process")),
        );

        let events = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(EngineRun {
            events,
            cancel: Some(Arc::new(ProcessCancel(cancel))),
        })
    }
}

impl Engine for ProcessEngine {
    fn submit(
        &self,
        prompt: &str,
        working_directory: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<EngineRun>> + Send + '_>> {
        let dir = if working_directory.as_os_str().is_empty() {
            self.working_directory.clone()
        } else {
            working_directory.to_path_buf()
        };
        let result = self.spawn(prompt, &dir);
        Box::pin(async move { result })
    }
}

/// Cancel handle for a running child process.
#[derive(Debug, Clone)]
pub struct ProcessCancel(CancellationToken);

impl Cancelable for ProcessCancel {
    fn cancel(&self) {
        self.0.cancel();
    }
}

/// Decode one stdout line; blank lines carry nothing.
fn decode_line(line: &str) -> Option<Result<UpdateEvent>> {
    if line.trim().is_empty() {
        None
    } else {
        Some(UpdateEvent::from_json(line))
    }
}

/// Own the child: forward events, honour cancellation, reap, clear `running`.
async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    tx: mpsc::Sender<Result<UpdateEvent>>,
    cancel: CancellationToken,
    grace: Duration,
    running: Arc<AtomicBool>,
) {
    if let Some(stderr) = stderr {
        tokio::spawn(drain_stderr(stderr));
    }

    let mut lines = FramedRead::new(stdout, EventLineCodec::new());
    let mut cancelled = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    let Some(item) = decode_line(&line) else { continue };
                    if tx.send(item).await.is_err() {
                        debug!("event receiver dropped; stopping engine");
                        cancelled = true;
                        break;
                    }
                }
                Some(Err(err)) => {
                    let _ = tx.send(Err(err)).await;
                    cancelled = true;
                    break;
                }
                None => break,
            }
        }
    }

    if cancelled {
        interrupt(&mut child, grace).await;
    } else {
        match child.wait().await {
            Ok(status) if status.success() => debug!("engine process exited"),
            Ok(status) => {
                let reason = status.code().map_or_else(
                    || "engine terminated by signal".to_owned(),
                    |c| format!("engine exited with code {c}"),
                );
                warn!(%reason, "engine process failed");
                let _ = tx.send(Err(AppError::Engine(reason))).await;
            }
            Err(err) => {
                warn!(%err, "error waiting for engine process");
                let _ = tx.send(Err(AppError::Engine(format!("wait error: {err}")))).await;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}

/// Interrupt, then force-kill once the grace period lapses.
async fn interrupt(child: &mut Child, grace: Duration) {
    send_interrupt(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(exit)) => info!(?exit, "engine process stopped after interrupt"),
        Ok(Err(err)) => warn!(%err, "error waiting for interrupted engine"),
        Err(_) => {
            warn!("engine ignored interrupt within grace period, forcing kill");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to force-kill engine process");
            }
        }
    }
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!(%err, pid, "failed to deliver SIGINT to engine");
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to stop engine process");
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "engine_stderr", "{line}");
    }
}
