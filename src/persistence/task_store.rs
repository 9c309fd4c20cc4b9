//! Task store implementations: `SQLite` for production, in-memory for tests.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::SecondsFormat;
use tokio::sync::Mutex;

use crate::models::task::Task;
use crate::{AppError, Result};

use super::db::Database;
use super::{StoreFuture, TaskStore};

/// Task store backed by the `task` table.
#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct TaskRow {
    body: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        serde_json::from_str(&self.body)
            .map_err(|err| AppError::Db(format!("corrupt task body: {err}")))
    }
}

impl SqliteTaskStore {
    /// Create a new store instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn fetch(&self, task_id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT body FROM task WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn write(&self, task: &Task) -> Result<()> {
        let body = serde_json::to_string(task)?;
        let token_count = i64::try_from(task.token_count).unwrap_or(i64::MAX);
        let updated_at = task
            .last_activity_time
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        sqlx::query(
            "INSERT INTO task (id, repo_path, status, session_id, token_count, updated_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 repo_path = excluded.repo_path,
                 status = excluded.status,
                 session_id = excluded.session_id,
                 token_count = excluded.token_count,
                 updated_at = excluded.updated_at,
                 body = excluded.body",
        )
        .bind(&task.id)
        .bind(&task.repo_path)
        .bind(task.status.as_str())
        .bind(&task.session_id)
        .bind(token_count)
        .bind(&updated_at)
        .bind(&body)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM task WHERE id = ?1")
            .bind(task_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}

impl TaskStore for SqliteTaskStore {
    fn get<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, Option<Task>> {
        Box::pin(self.fetch(task_id))
    }

    fn upsert<'a>(&'a self, task: &'a Task) -> StoreFuture<'a, ()> {
        Box::pin(self.write(task))
    }

    fn delete<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.remove(task_id))
    }
}

/// Process-local task store.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn get<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, Option<Task>> {
        Box::pin(async move { Ok(self.tasks.lock().await.get(task_id).cloned()) })
    }

    fn upsert<'a>(&'a self, task: &'a Task) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.tasks
                .lock()
                .await
                .insert(task.id.clone(), task.clone());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.tasks.lock().await.remove(task_id);
            Ok(())
        })
    }
}
