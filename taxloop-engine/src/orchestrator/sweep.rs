//! Stale-work recovery
//!
//! A run or batch whose worker died stops heartbeating. The sweep fails
//! stale runs (their attempt is lost; the retry budget covers them) and
//! requeues stale batches so another worker replica can claim them.

use crate::db;
use crate::orchestrator::state::{BatchStatus, RunStatus};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use taxloop_common::{Error, Result};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub runs_failed: u32,
    pub batches_requeued: u32,
}

/// One sweep pass over runs and batches last updated before the stale
/// cutoff.
pub async fn sweep_once(pool: &SqlitePool, stale_timeout_secs: u64) -> Result<SweepReport> {
    let cutoff = (Utc::now() - ChronoDuration::seconds(stale_timeout_secs as i64)).to_rfc3339();
    let mut report = SweepReport::default();

    for run in db::runs::list_stale_running(pool, &cutoff).await? {
        match db::runs::finish(
            pool,
            run.run_id,
            RunStatus::Failed,
            Some("Stale: no heartbeat within timeout"),
            None,
        )
        .await
        {
            Ok(()) => {
                warn!(run_id = %run.run_id, "Failed stale run");
                report.runs_failed += 1;
            }
            // Finished between listing and update; nothing to recover
            Err(Error::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
    }

    for batch in db::batches::list_stale_running(pool, &cutoff).await? {
        let moved = db::batches::transition(
            pool,
            batch.batch_id,
            BatchStatus::Running,
            BatchStatus::Queued,
            None,
        )
        .await?;
        if moved {
            warn!(batch_id = %batch.batch_id, "Requeued stale batch");
            report.batches_requeued += 1;
        }
    }

    if report != SweepReport::default() {
        info!(
            runs_failed = report.runs_failed,
            batches_requeued = report.batches_requeued,
            "Stale sweep recovered work"
        );
    }
    Ok(report)
}

/// Periodic sweep loop; runs until the task is aborted.
pub async fn run_sweeper(pool: SqlitePool, interval_secs: u64, stale_timeout_secs: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&pool, stale_timeout_secs).await {
            warn!("Stale sweep failed: {}", e);
        }
    }
}
