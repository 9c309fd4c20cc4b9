//! Streaming relay: engine events to one consumer, folded into the task.
//!
//! The relay is the only writer to a submission's sink while it runs. It
//! always pushes `session{sessionId}` first and ends the stream with
//! exactly one terminal event, whichever of these happens first:
//!
//! - the engine yields `done` or `error`;
//! - the engine's stream ends, and a `done` is synthesized;
//! - a transport fault or heartbeat trigger, turned into an `error`;
//! - an outside stop (kill, supersede, eviction). The stopper has already
//!   delivered the `error`, so the relay only records it.
//!
//! A consumer that goes away does not stop the relay; the remaining events
//! are still folded and checkpointed.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use super::builder::MessageBuilder;
use super::heartbeat::{HeartbeatMonitor, HeartbeatPolicy};
use super::registry::SubmissionTicket;
use super::sink::EventSink;
use crate::engine::{Cancelable, EngineRun};
use crate::models::event::UpdateEvent;
use crate::AppError;

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The engine sent its own terminal event.
    Terminal,
    /// The engine stream ended without one.
    Exhausted,
    /// A transport fault or heartbeat trigger.
    Fault(AppError),
    /// Stopped from outside with the given reason.
    Stopped(String),
}

/// Drive one submission to completion.
pub async fn relay(
    mut ticket: SubmissionTicket,
    run: EngineRun,
    sink: EventSink,
    mut builder: MessageBuilder,
    policy: HeartbeatPolicy,
) -> RelayOutcome {
    let session = Arc::clone(ticket.session());
    let EngineRun { mut events, cancel } = run;

    if !ticket.attach(cancel.clone(), sink.clone()) {
        let reason = ticket.stop_signal().reason();
        info!(reason, "submission stopped before the stream attached");
        cancel_engine(cancel.as_ref());
        record(&mut builder, &UpdateEvent::error(reason.clone())).await;
        drop(builder);
        sink.terminate(&UpdateEvent::error(reason.clone()));
        ticket.release();
        return RelayOutcome::Stopped(reason);
    }

    sink.push_event(&UpdateEvent::Session {
        session_id: session.id().to_owned(),
    });

    let mut monitor = HeartbeatMonitor::spawn(session.id(), policy, cancel.clone());
    let stop = ticket.stop_signal().clone();
    let mut delivered: u64 = 0;

    let outcome = loop {
        tokio::select! {
            biased;
            () = stop.stopped() => break RelayOutcome::Stopped(stop.reason()),
            fault = monitor.fault() => break RelayOutcome::Fault(fault),
            next = events.next() => match next {
                Some(Ok(event)) => {
                    monitor.observe();
                    session.observe_event();
                    debug!(kind = event.kind(), "event");
                    record(&mut builder, &event).await;
                    sink.push_event(&event);
                    delivered += 1;
                    if event.is_terminal() {
                        break RelayOutcome::Terminal;
                    }
                }
                Some(Err(err)) if !err.is_fatal_in_stream() => {
                    monitor.observe();
                    session.observe_event();
                    warn!(%err, "skipping undeliverable event");
                    sink.push_event(&UpdateEvent::error(err.in_stream_message()));
                }
                Some(Err(err)) => break RelayOutcome::Fault(err),
                None => break RelayOutcome::Exhausted,
            }
        }
    };
    drop(monitor);

    match &outcome {
        RelayOutcome::Terminal => {}
        RelayOutcome::Exhausted => {
            record(&mut builder, &UpdateEvent::Done).await;
            sink.push_event(&UpdateEvent::Done);
        }
        RelayOutcome::Fault(err) => {
            error!(%err, "stream failed");
            cancel_engine(cancel.as_ref());
            let event = UpdateEvent::error(err.in_stream_message());
            record(&mut builder, &event).await;
            sink.push_event(&event);
        }
        RelayOutcome::Stopped(reason) => {
            info!(reason, "stream stopped from outside");
            cancel_engine(cancel.as_ref());
            record(&mut builder, &UpdateEvent::error(reason.clone())).await;
        }
    }

    // The task is free for the next writer before the consumer sees the end.
    let status = builder.task().status;
    drop(builder);
    sink.close();
    ticket.release();
    info!(delivered, status = status.as_str(), "stream closed");
    outcome
}

fn cancel_engine(cancel: Option<&Arc<dyn Cancelable>>) {
    if let Some(handle) = cancel {
        handle.cancel();
    }
}

async fn record(builder: &mut MessageBuilder, event: &UpdateEvent) {
    if let Err(err) = builder.apply(event).await {
        error!(%err, kind = event.kind(), "checkpoint write failed");
    }
}
