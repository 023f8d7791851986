//! Harness run persistence

use crate::models::{HarnessResult, MetricScore};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use taxloop_common::Result;
use uuid::Uuid;

pub async fn insert(pool: &SqlitePool, result: &HarnessResult) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO harness_runs (
            harness_run_id, store_id, candidate_run_id, baseline_run_id,
            snapshot_id, passed, scores, failed_metrics, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(result.harness_run_id.to_string())
    .bind(&result.store_id)
    .bind(result.candidate_run_id.to_string())
    .bind(result.baseline_run_id.to_string())
    .bind(result.snapshot_id.to_string())
    .bind(result.passed as i64)
    .bind(serde_json::to_string(&result.scores)?)
    .bind(serde_json::to_string(&result.failed_metrics)?)
    .bind(result.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<HarnessResult> {
    let harness_run_id: String = row.get("harness_run_id");
    let candidate: String = row.get("candidate_run_id");
    let baseline: String = row.get("baseline_run_id");
    let snapshot: String = row.get("snapshot_id");
    let scores_raw: String = row.get("scores");
    let failed_raw: String = row.get("failed_metrics");
    let created_raw: String = row.get("created_at");

    let scores: HashMap<String, MetricScore> = serde_json::from_str(&scores_raw)?;
    let failed_metrics: Vec<String> = serde_json::from_str(&failed_raw)?;

    Ok(HarnessResult {
        harness_run_id: super::parse_uuid(&harness_run_id, "harness_run_id")?,
        store_id: row.get("store_id"),
        candidate_run_id: super::parse_uuid(&candidate, "candidate_run_id")?,
        baseline_run_id: super::parse_uuid(&baseline, "baseline_run_id")?,
        snapshot_id: super::parse_uuid(&snapshot, "snapshot_id")?,
        passed: row.get::<i64, _>("passed") != 0,
        scores,
        failed_metrics,
        created_at: super::parse_ts(&created_raw, "created_at")?,
    })
}

pub async fn get(pool: &SqlitePool, harness_run_id: Uuid) -> Result<Option<HarnessResult>> {
    let row = sqlx::query("SELECT * FROM harness_runs WHERE harness_run_id = ?")
        .bind(harness_run_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Most recent harness result for a store; the gate consulted before apply.
pub async fn latest(pool: &SqlitePool, store_id: &str) -> Result<Option<HarnessResult>> {
    let row = sqlx::query(
        "SELECT * FROM harness_runs WHERE store_id = ?
         ORDER BY created_at DESC, harness_run_id DESC LIMIT 1",
    )
    .bind(store_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}
