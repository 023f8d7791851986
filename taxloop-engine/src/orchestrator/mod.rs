//! Self-improvement orchestration
//!
//! Batches are the unit of operator intent: N loop iterations of a given
//! type with a retry budget. Workers claim batches and loop attempts through
//! atomic compare-and-set claims, so any number of replicas can run against
//! one database without double-processing.

pub mod state;
mod sweep;
mod worker;

pub use sweep::{run_sweeper, sweep_once, SweepReport};
pub use worker::Worker;

use crate::db;
use chrono::Utc;
use sqlx::SqlitePool;
use state::{BatchStatus, BatchSummary, LoopType, SelfImprovementBatch};
use taxloop_common::{Error, Result};
use tracing::info;
use uuid::Uuid;

/// Enqueue a new batch for workers to pick up.
pub async fn enqueue_batch(
    pool: &SqlitePool,
    store_id: &str,
    loop_type: LoopType,
    loop_count: u32,
    retry_limit: u32,
    structural_cap: u32,
    auto_apply: bool,
) -> Result<SelfImprovementBatch> {
    if loop_count == 0 {
        return Err(Error::InvalidInput("loop_count must be >= 1".into()));
    }
    let now = Utc::now();
    let batch = SelfImprovementBatch {
        batch_id: Uuid::new_v4(),
        store_id: store_id.to_string(),
        loop_type,
        loop_count,
        retry_limit: retry_limit.max(1),
        structural_cap,
        auto_apply,
        status: BatchStatus::Queued,
        failure_reason: None,
        summary: BatchSummary::default(),
        created_at: now,
        updated_at: now,
    };
    db::batches::insert(pool, &batch).await?;
    info!(
        batch_id = %batch.batch_id,
        store_id,
        loop_type = loop_type.as_str(),
        loop_count,
        "Batch enqueued"
    );
    Ok(batch)
}

/// Cancel a batch. Queued batches cancel immediately; running batches stop
/// at the next loop boundary. Returns false when the batch is already
/// terminal.
pub async fn cancel_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<bool> {
    let batch = db::batches::get(pool, batch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Batch not found: {}", batch_id)))?;

    if batch.status.is_terminal() {
        return Ok(false);
    }
    let cancelled = db::batches::transition(
        pool,
        batch_id,
        batch.status,
        BatchStatus::Cancelled,
        Some("Cancelled by operator"),
    )
    .await?;
    if cancelled {
        info!(batch_id = %batch_id, "Batch cancelled");
    }
    Ok(cancelled)
}
