//! Delivery endpoint of a session's stream.
//!
//! An [`EventSink`] wraps the sending half of the channel the transport
//! drains. Cloned handles share one slot, so a forced stop on the session
//! side and the relay side observe the same closed state.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::warn;

use crate::models::event::UpdateEvent;

/// Receiving half handed to the transport. Each item is one JSON frame body.
pub type FrameReceiver = mpsc::UnboundedReceiver<String>;

/// Push/close capability for one attached consumer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl EventSink {
    /// Create a connected sink and the receiver the transport reads from.
    #[must_use]
    pub fn channel() -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Encode and push an event.
    ///
    /// An event that cannot be encoded is replaced by an `error` event
    /// describing the failure. Returns `false` once the sink is closed or
    /// the consumer has gone away.
    pub fn push_event(&self, event: &UpdateEvent) -> bool {
        match event.to_wire_json() {
            Ok(frame) => self.push_frame(frame),
            Err(err) => {
                warn!(kind = event.kind(), %err, "event encoding failed");
                let substitute = UpdateEvent::error(err.in_stream_message());
                substitute
                    .to_wire_json()
                    .is_ok_and(|frame| self.push_frame(frame))
            }
        }
    }

    /// Push an already-encoded frame body.
    pub fn push_frame(&self, frame: String) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Push a final event and close, with no other push in between.
    ///
    /// Returns `false` if the sink was already closed.
    pub fn terminate(&self, event: &UpdateEvent) -> bool {
        let frame = event
            .to_wire_json()
            .unwrap_or_else(|_| r#"{"type":"error","text":"stream terminated"}"#.to_owned());
        let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(tx) => {
                let _ = tx.send(frame);
                true
            }
            None => false,
        }
    }

    /// Close the sink. Later pushes are dropped. Idempotent.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
