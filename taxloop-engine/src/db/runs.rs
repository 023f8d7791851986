//! Run persistence and atomic run claims

use crate::models::RunMetrics;
use crate::orchestrator::state::{RunStatus, SelfImprovementRun};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use taxloop_common::{Error, Result};
use uuid::Uuid;

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SelfImprovementRun> {
    let run_id: String = row.get("run_id");
    let batch_id: String = row.get("batch_id");
    let status_raw: String = row.get("status");
    let metrics_raw: Option<String> = row.get("metrics");
    let created_raw: String = row.get("created_at");
    let updated_raw: String = row.get("updated_at");

    Ok(SelfImprovementRun {
        run_id: super::parse_uuid(&run_id, "run_id")?,
        batch_id: super::parse_uuid(&batch_id, "batch_id")?,
        store_id: row.get("store_id"),
        sequence_no: row.get::<i64, _>("sequence_no") as u32,
        attempt_no: row.get::<i64, _>("attempt_no") as u32,
        status: RunStatus::parse(&status_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown run status: {}", status_raw)))?,
        failure_reason: row.get("failure_reason"),
        metrics: metrics_raw
            .map(|raw| serde_json::from_str::<RunMetrics>(&raw))
            .transpose()?,
        created_at: super::parse_ts(&created_raw, "created_at")?,
        updated_at: super::parse_ts(&updated_raw, "updated_at")?,
    })
}

/// Claim one loop iteration: insert a `running` run row for (batch,
/// sequence_no, attempt_no). The UNIQUE constraint makes this the atomic
/// claim; when two replicas race, exactly one insert succeeds and the loser
/// receives None.
pub async fn claim(
    pool: &SqlitePool,
    batch_id: Uuid,
    store_id: &str,
    sequence_no: u32,
    attempt_no: u32,
) -> Result<Option<SelfImprovementRun>> {
    let run_id = Uuid::new_v4();
    let now = Utc::now().to_rfc3339();

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO runs (
            run_id, batch_id, store_id, sequence_no, attempt_no, status,
            failure_reason, metrics, created_at, updated_at, started_at, ended_at
        ) VALUES (?, ?, ?, ?, ?, 'running', NULL, NULL, ?, ?, ?, NULL)
        "#,
    )
    .bind(run_id.to_string())
    .bind(batch_id.to_string())
    .bind(store_id)
    .bind(sequence_no as i64)
    .bind(attempt_no as i64)
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    if inserted.rows_affected() != 1 {
        return Ok(None);
    }
    get(pool, run_id).await
}

pub async fn get(pool: &SqlitePool, run_id: Uuid) -> Result<Option<SelfImprovementRun>> {
    let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<SelfImprovementRun>> {
    let rows = sqlx::query(
        "SELECT * FROM runs WHERE batch_id = ? ORDER BY sequence_no ASC, attempt_no ASC",
    )
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Finish a run: conditional on it still being `running`.
pub async fn finish(
    pool: &SqlitePool,
    run_id: Uuid,
    status: RunStatus,
    failure_reason: Option<&str>,
    metrics: Option<&RunMetrics>,
) -> Result<()> {
    if status == RunStatus::Running {
        return Err(Error::InvalidInput("Cannot finish a run as running".into()));
    }
    let now = Utc::now().to_rfc3339();
    let metrics_json = metrics.map(serde_json::to_string).transpose()?;

    let updated = sqlx::query(
        "UPDATE runs SET status = ?, failure_reason = ?, metrics = COALESCE(?, metrics),
         ended_at = ?, updated_at = ? WHERE run_id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(failure_reason)
    .bind(metrics_json)
    .bind(&now)
    .bind(&now)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;

    if updated.rows_affected() != 1 {
        return Err(Error::Conflict(format!("Run {} is not running", run_id)));
    }
    Ok(())
}

/// Persist metrics on a run that stays running (used mid-loop).
pub async fn set_metrics(pool: &SqlitePool, run_id: Uuid, metrics: &RunMetrics) -> Result<()> {
    sqlx::query("UPDATE runs SET metrics = ?, updated_at = ? WHERE run_id = ?")
        .bind(serde_json::to_string(metrics)?)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recent non-failed run for a store: the default harness baseline.
pub async fn latest_non_failed(
    pool: &SqlitePool,
    store_id: &str,
) -> Result<Option<SelfImprovementRun>> {
    let row = sqlx::query(
        "SELECT * FROM runs WHERE store_id = ? AND status = 'succeeded'
         ORDER BY created_at DESC, run_id DESC LIMIT 1",
    )
    .bind(store_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

/// Runs stuck in `running` with no update since the stale cutoff.
pub async fn list_stale_running(
    pool: &SqlitePool,
    cutoff_rfc3339: &str,
) -> Result<Vec<SelfImprovementRun>> {
    let rows = sqlx::query("SELECT * FROM runs WHERE status = 'running' AND updated_at < ?")
        .bind(cutoff_rfc3339)
        .fetch_all(pool)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Touch updated_at so the stale sweep sees live progress.
pub async fn heartbeat(pool: &SqlitePool, run_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE runs SET updated_at = ? WHERE run_id = ? AND status = 'running'")
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
