//! Batch persistence and atomic claims

use crate::orchestrator::state::{BatchStatus, BatchSummary, LoopType, SelfImprovementBatch};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use taxloop_common::{Error, Result};
use uuid::Uuid;

pub async fn insert(pool: &SqlitePool, batch: &SelfImprovementBatch) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO batches (
            batch_id, store_id, loop_type, loop_count, retry_limit,
            structural_cap, auto_apply, status, failure_reason, summary,
            created_at, updated_at, started_at, ended_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
        "#,
    )
    .bind(batch.batch_id.to_string())
    .bind(&batch.store_id)
    .bind(batch.loop_type.as_str())
    .bind(batch.loop_count as i64)
    .bind(batch.retry_limit as i64)
    .bind(batch.structural_cap as i64)
    .bind(batch.auto_apply as i64)
    .bind(batch.status.as_str())
    .bind(&batch.failure_reason)
    .bind(serde_json::to_string(&batch.summary)?)
    .bind(batch.created_at.to_rfc3339())
    .bind(batch.updated_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SelfImprovementBatch> {
    let batch_id: String = row.get("batch_id");
    let loop_type_raw: String = row.get("loop_type");
    let status_raw: String = row.get("status");
    let summary_raw: String = row.get("summary");
    let created_raw: String = row.get("created_at");
    let updated_raw: String = row.get("updated_at");

    Ok(SelfImprovementBatch {
        batch_id: super::parse_uuid(&batch_id, "batch_id")?,
        store_id: row.get("store_id"),
        loop_type: LoopType::parse(&loop_type_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown loop type: {}", loop_type_raw)))?,
        loop_count: row.get::<i64, _>("loop_count") as u32,
        retry_limit: row.get::<i64, _>("retry_limit") as u32,
        structural_cap: row.get::<i64, _>("structural_cap") as u32,
        auto_apply: row.get::<i64, _>("auto_apply") != 0,
        status: BatchStatus::parse(&status_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown batch status: {}", status_raw)))?,
        failure_reason: row.get("failure_reason"),
        summary: serde_json::from_str::<BatchSummary>(&summary_raw)?,
        created_at: super::parse_ts(&created_raw, "created_at")?,
        updated_at: super::parse_ts(&updated_raw, "updated_at")?,
    })
}

pub async fn get(pool: &SqlitePool, batch_id: Uuid) -> Result<Option<SelfImprovementBatch>> {
    let row = sqlx::query("SELECT * FROM batches WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<SelfImprovementBatch>> {
    let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Atomically claim the oldest queued batch: compare-and-set on status so
/// concurrent worker replicas can never both win the same batch.
pub async fn claim_next_queued(pool: &SqlitePool) -> Result<Option<SelfImprovementBatch>> {
    loop {
        let candidate = sqlx::query(
            "SELECT batch_id FROM batches WHERE status = 'queued' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let batch_id: String = row.get("batch_id");
        let now = Utc::now().to_rfc3339();

        let claimed = sqlx::query(
            "UPDATE batches SET status = 'running', started_at = COALESCE(started_at, ?), updated_at = ?
             WHERE batch_id = ? AND status = 'queued'",
        )
        .bind(&now)
        .bind(&now)
        .bind(&batch_id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            let batch_id = super::parse_uuid(&batch_id, "batch_id")?;
            return get(pool, batch_id).await;
        }
        // Another replica won the race; try the next queued batch.
    }
}

/// Conditional status transition honoring the batch FSM. Returns false when
/// the row was not in `from` (another replica moved it first).
pub async fn transition(
    pool: &SqlitePool,
    batch_id: Uuid,
    from: BatchStatus,
    to: BatchStatus,
    failure_reason: Option<&str>,
) -> Result<bool> {
    if !BatchStatus::can_transition(from, to) {
        return Err(Error::Conflict(format!(
            "Illegal batch transition {} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }

    let now = Utc::now().to_rfc3339();
    let ended_at = if to.is_terminal() { Some(now.clone()) } else { None };

    let updated = sqlx::query(
        "UPDATE batches SET status = ?, failure_reason = COALESCE(?, failure_reason),
         ended_at = COALESCE(?, ended_at), updated_at = ?
         WHERE batch_id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(failure_reason)
    .bind(ended_at)
    .bind(&now)
    .bind(batch_id.to_string())
    .bind(from.as_str())
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() == 1)
}

pub async fn update_summary(
    pool: &SqlitePool,
    batch_id: Uuid,
    summary: &BatchSummary,
) -> Result<()> {
    sqlx::query("UPDATE batches SET summary = ?, updated_at = ? WHERE batch_id = ?")
        .bind(serde_json::to_string(summary)?)
        .bind(Utc::now().to_rfc3339())
        .bind(batch_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Batches stuck in `running` with no update since the stale cutoff.
pub async fn list_stale_running(
    pool: &SqlitePool,
    cutoff_rfc3339: &str,
) -> Result<Vec<SelfImprovementBatch>> {
    let rows = sqlx::query("SELECT * FROM batches WHERE status = 'running' AND updated_at < ?")
        .bind(cutoff_rfc3339)
        .fetch_all(pool)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Touch updated_at so the stale sweep sees live progress.
pub async fn heartbeat(pool: &SqlitePool, batch_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE batches SET updated_at = ? WHERE batch_id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(batch_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
