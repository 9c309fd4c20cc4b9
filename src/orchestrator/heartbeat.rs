//! Per-stream liveness supervision.
//!
//! A [`HeartbeatMonitor`] runs two independent timers for the lifetime of
//! one relay:
//!
//! - a hard wall-clock limit that ends the stream regardless of activity;
//! - a recurring inactivity check that warns after `warn_after` and
//!   force-terminates after `kill_after` without events.
//!
//! On either trigger the engine's cancel handle (if any) is invoked and
//! the fault is delivered through [`HeartbeatMonitor::fault`]. Dropping the
//! monitor cancels the background task, so neither timer can fire after
//! the stream has closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::HeartbeatConfig;
use crate::engine::Cancelable;
use crate::AppError;

/// Thresholds applied by a [`HeartbeatMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Unconditional stream lifetime.
    pub hard_timeout: Duration,
    /// Period of the inactivity check.
    pub check_interval: Duration,
    /// Inactivity that produces a warning log.
    pub warn_after: Duration,
    /// Inactivity that terminates the stream.
    pub kill_after: Duration,
    /// Inactivity that flags a session as stuck to consumers.
    pub stuck_warning: Duration,
}

impl From<&HeartbeatConfig> for HeartbeatPolicy {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            hard_timeout: Duration::from_secs(config.hard_timeout_seconds),
            check_interval: Duration::from_secs(config.check_interval_seconds),
            warn_after: Duration::from_secs(config.warn_after_seconds),
            kill_after: Duration::from_secs(config.kill_after_seconds),
            stuck_warning: Duration::from_secs(config.stuck_warning_seconds),
        }
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self::from(&HeartbeatConfig::default())
    }
}

/// Running supervisor for one stream.
pub struct HeartbeatMonitor {
    started: Instant,
    last_event_ms: Arc<AtomicU64>,
    fault_rx: mpsc::Receiver<AppError>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Start both timers.
    ///
    /// `engine_cancel` is invoked before the fault is reported.
    #[must_use]
    pub fn spawn(
        session_id: &str,
        policy: HeartbeatPolicy,
        engine_cancel: Option<Arc<dyn Cancelable>>,
    ) -> Self {
        let started = Instant::now();
        let last_event_ms = Arc::new(AtomicU64::new(0));
        let (fault_tx, fault_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        tokio::spawn(
            run(
                policy,
                started,
                Arc::clone(&last_event_ms),
                engine_cancel,
                fault_tx,
                cancel.clone(),
            )
            .instrument(info_span!("heartbeat", session_id = %session_id)),
        );

        Self {
            started,
            last_event_ms,
            fault_rx,
            cancel,
        }
    }

    /// Record that an event was observed now.
    pub fn observe(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_event_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    /// Resolve when a timer fires. Pending forever once the monitor has
    /// stopped without a fault.
    pub async fn fault(&mut self) -> AppError {
        match self.fault_rx.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    policy: HeartbeatPolicy,
    started: Instant,
    last_event_ms: Arc<AtomicU64>,
    engine_cancel: Option<Arc<dyn Cancelable>>,
    fault_tx: mpsc::Sender<AppError>,
    cancel: CancellationToken,
) {
    let hard_deadline = tokio::time::sleep(policy.hard_timeout);
    tokio::pin!(hard_deadline);

    let mut ticker = tokio::time::interval_at(started + policy.check_interval, policy.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut warned = false;

    let fault = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("heartbeat stopped");
                return;
            }
            () = &mut hard_deadline => {
                warn!(limit_secs = policy.hard_timeout.as_secs(), "stream exceeded hard timeout");
                break AppError::StreamTimeout(format!(
                    "no completion within {}s",
                    policy.hard_timeout.as_secs()
                ));
            }
            _ = ticker.tick() => {
                let idle = idle_since(started, &last_event_ms);
                if idle >= policy.kill_after {
                    warn!(idle_secs = idle.as_secs(), "stream inactive past kill threshold");
                    break AppError::StreamHung(format!(
                        "no events received for {}s",
                        idle.as_secs()
                    ));
                }
                if idle >= policy.warn_after {
                    if !warned {
                        warn!(idle_secs = idle.as_secs(), "stream inactive");
                        warned = true;
                    }
                } else {
                    warned = false;
                }
            }
        }
    };

    if let Some(handle) = engine_cancel {
        handle.cancel();
    }
    let _ = fault_tx.send(fault).await;
}

fn idle_since(started: Instant, last_event_ms: &AtomicU64) -> Duration {
    let last = started + Duration::from_millis(last_event_ms.load(Ordering::SeqCst));
    Instant::now().saturating_duration_since(last)
}
