//! Benchmark snapshot persistence

use crate::models::{BenchmarkSnapshot, Product};
use sqlx::{Row, SqlitePool};
use taxloop_common::Result;
use uuid::Uuid;

pub async fn insert(pool: &SqlitePool, snapshot: &BenchmarkSnapshot) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO benchmark_snapshots (
            snapshot_id, store_id, content_hash, sample, sample_size, created_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(snapshot.snapshot_id.to_string())
    .bind(&snapshot.store_id)
    .bind(&snapshot.content_hash)
    .bind(serde_json::to_string(&snapshot.sample)?)
    .bind(snapshot.sample.len() as i64)
    .bind(snapshot.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BenchmarkSnapshot> {
    let snapshot_id: String = row.get("snapshot_id");
    let sample_raw: String = row.get("sample");
    let created_raw: String = row.get("created_at");
    let sample: Vec<Product> = serde_json::from_str(&sample_raw)?;

    Ok(BenchmarkSnapshot {
        snapshot_id: super::parse_uuid(&snapshot_id, "snapshot_id")?,
        store_id: row.get("store_id"),
        content_hash: row.get("content_hash"),
        sample,
        created_at: super::parse_ts(&created_raw, "created_at")?,
    })
}

pub async fn get(pool: &SqlitePool, snapshot_id: Uuid) -> Result<Option<BenchmarkSnapshot>> {
    let row = sqlx::query("SELECT * FROM benchmark_snapshots WHERE snapshot_id = ?")
        .bind(snapshot_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn latest(pool: &SqlitePool, store_id: &str) -> Result<Option<BenchmarkSnapshot>> {
    let row = sqlx::query(
        "SELECT * FROM benchmark_snapshots WHERE store_id = ?
         ORDER BY created_at DESC, snapshot_id DESC LIMIT 1",
    )
    .bind(store_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}
