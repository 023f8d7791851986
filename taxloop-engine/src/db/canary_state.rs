//! Persisted canary state: `{last_run_id, last_hotlist_path, updated_at}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use taxloop_common::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryState {
    pub store_id: String,
    pub last_run_id: Option<String>,
    pub last_hotlist_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub async fn get(pool: &SqlitePool, store_id: &str) -> Result<Option<CanaryState>> {
    let row = sqlx::query("SELECT * FROM canary_state WHERE store_id = ?")
        .bind(store_id)
        .fetch_optional(pool)
        .await?;

    row.map(|row| {
        let updated_raw: String = row.get("updated_at");
        Ok(CanaryState {
            store_id: row.get("store_id"),
            last_run_id: row.get("last_run_id"),
            last_hotlist_path: row.get("last_hotlist_path"),
            updated_at: super::parse_ts(&updated_raw, "updated_at")?,
        })
    })
    .transpose()
}

pub async fn upsert(
    pool: &SqlitePool,
    store_id: &str,
    last_run_id: Option<&str>,
    last_hotlist_path: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO canary_state (store_id, last_run_id, last_hotlist_path, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(store_id) DO UPDATE SET
            last_run_id = COALESCE(excluded.last_run_id, canary_state.last_run_id),
            last_hotlist_path = COALESCE(excluded.last_hotlist_path, canary_state.last_hotlist_path),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(store_id)
    .bind(last_run_id)
    .bind(last_hotlist_path)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}
