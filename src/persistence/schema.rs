//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the task table definition to the connected database.
///
/// The full record lives in `body` as JSON; the remaining columns are
/// projections used for filtering and retention.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS task (
    id              TEXT PRIMARY KEY NOT NULL,
    repo_path       TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed')),
    session_id      TEXT,
    token_count     INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL,
    body            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_session ON task(session_id);
CREATE INDEX IF NOT EXISTS idx_task_status_updated ON task(status, updated_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
