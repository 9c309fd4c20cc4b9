//! Retention service for time-based task purge.
//!
//! Runs as a background task deleting finished (`completed` / `failed`)
//! tasks whose last update is older than `retention_days`. Running and
//! pending tasks are never purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::db::Database;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The first purge runs immediately, then hourly.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("retention task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = purge(&db, retention_days).await {
                            error!(?err, "retention purge failed");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("task_retention")),
    )
}

/// Delete finished tasks last updated more than `retention_days` ago.
///
/// Returns the number of rows removed.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(db: &Database, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

    let result = sqlx::query(
        "DELETE FROM task WHERE status IN ('completed','failed') AND updated_at < ?1",
    )
    .bind(cutoff.to_rfc3339_opts(SecondsFormat::Millis, true))
    .execute(db)
    .await?;

    let purged = result.rows_affected();
    info!(retention_days, purged, "retention purge completed");
    Ok(purged)
}
