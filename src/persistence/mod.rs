//! Persistence layer modules.
//!
//! The task store is the single authoritative writer target for
//! conversation records. Only the message builder writes through it;
//! everything else reads.

pub mod db;
pub mod retention;
pub mod schema;
pub mod task_store;

use std::future::Future;
use std::pin::Pin;

use crate::models::task::Task;
use crate::Result;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Boxed future returned by [`TaskStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable key-value store for task records.
///
/// Implementations must provide an atomic upsert-by-id; callers never
/// coordinate writes beyond that.
pub trait TaskStore: Send + Sync {
    /// Fetch a task by identifier.
    fn get<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, Option<Task>>;

    /// Insert or replace a task.
    fn upsert<'a>(&'a self, task: &'a Task) -> StoreFuture<'a, ()>;

    /// Remove a task. Removing an absent task is not an error.
    fn delete<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, ()>;
}
