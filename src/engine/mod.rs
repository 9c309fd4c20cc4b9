//! Engine capability boundary.
//!
//! The engine is opaque: given a prompt and a working directory it returns
//! a stream of [`UpdateEvent`]s and, optionally, a [`Cancelable`] handle.
//! Each session owns exactly one [`Engine`], produced by an
//! [`EngineFactory`] when the session is created.

pub mod codec;
pub mod process;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::BoxStream;

use crate::models::event::UpdateEvent;
use crate::Result;

/// Items yielded by an engine run.
///
/// `Err(AppError::Serialization)` marks a single undecodable event and is
/// survivable; any other error is a transport fault that ends the stream.
pub type EventStream = BoxStream<'static, Result<UpdateEvent>>;

/// Best-effort cancellation of an in-flight engine run.
pub trait Cancelable: Send + Sync {
    /// Ask the engine to stop. Idempotent; completion is not guaranteed.
    fn cancel(&self);
}

/// A started engine submission.
pub struct EngineRun {
    /// Ordered event sequence.
    pub events: EventStream,
    /// Cancel handle; `None` when the engine cannot be cancelled.
    pub cancel: Option<Arc<dyn Cancelable>>,
}

impl std::fmt::Debug for EngineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRun")
            .field("cancelable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// Opaque producer of update-event streams.
pub trait Engine: Send + Sync {
    /// Start a submission.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SessionBusy`](crate::AppError::SessionBusy) while a
    /// previous run has not wound down, or
    /// [`AppError::Engine`](crate::AppError::Engine) if the run cannot start.
    fn submit(
        &self,
        prompt: &str,
        working_directory: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<EngineRun>> + Send + '_>>;
}

/// Creates the engine a new session will own.
pub trait EngineFactory: Send + Sync {
    /// Build an engine bound to `working_directory`.
    fn create(&self, working_directory: &Path) -> Arc<dyn Engine>;
}
