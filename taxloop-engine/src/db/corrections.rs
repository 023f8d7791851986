//! QA correction persistence

use crate::models::QaCorrection;
use sqlx::{Row, SqlitePool};
use taxloop_common::Result;
use uuid::Uuid;

pub async fn insert(pool: &SqlitePool, correction: &QaCorrection) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO qa_corrections (
            correction_id, store_id, run_id, sku, predicted_slug,
            corrected_slug, notes, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(correction.correction_id.to_string())
    .bind(&correction.store_id)
    .bind(correction.run_id.map(|id| id.to_string()))
    .bind(&correction.sku)
    .bind(&correction.predicted_slug)
    .bind(&correction.corrected_slug)
    .bind(&correction.notes)
    .bind(correction.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QaCorrection> {
    let correction_id: String = row.get("correction_id");
    let run_id: Option<String> = row.get("run_id");
    let created_raw: String = row.get("created_at");

    Ok(QaCorrection {
        correction_id: super::parse_uuid(&correction_id, "correction_id")?,
        store_id: row.get("store_id"),
        run_id: run_id.map(|id| super::parse_uuid(&id, "run_id")).transpose()?,
        sku: row.get("sku"),
        predicted_slug: row.get("predicted_slug"),
        corrected_slug: row.get("corrected_slug"),
        notes: row.get("notes"),
        created_at: super::parse_ts(&created_raw, "created_at")?,
    })
}

pub async fn list_for_store(pool: &SqlitePool, store_id: &str) -> Result<Vec<QaCorrection>> {
    let rows =
        sqlx::query("SELECT * FROM qa_corrections WHERE store_id = ? ORDER BY created_at ASC")
            .bind(store_id)
            .fetch_all(pool)
            .await?;
    rows.iter().map(from_row).collect()
}

pub async fn list_for_run(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<QaCorrection>> {
    let rows = sqlx::query("SELECT * FROM qa_corrections WHERE run_id = ? ORDER BY created_at ASC")
        .bind(run_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.iter().map(from_row).collect()
}
