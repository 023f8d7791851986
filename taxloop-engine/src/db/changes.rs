//! AppliedChange persistence

use crate::models::{AppliedChange, ChangeStatus};
use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use taxloop_common::{Error, Result};
use uuid::Uuid;

pub async fn insert_tx(tx: &mut Transaction<'_, Sqlite>, change: &AppliedChange) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO applied_changes (
            change_id, proposal_id, store_id, version_before, version_after,
            status, rollback_token, metadata, applied_at, rolled_back_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(change.change_id.to_string())
    .bind(change.proposal_id.to_string())
    .bind(&change.store_id)
    .bind(&change.version_before)
    .bind(&change.version_after)
    .bind(change.status.as_str())
    .bind(&change.rollback_token)
    .bind(change.metadata.to_string())
    .bind(change.applied_at.to_rfc3339())
    .bind(change.rolled_back_at.map(|dt| dt.to_rfc3339()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AppliedChange> {
    let change_id: String = row.get("change_id");
    let proposal_id: String = row.get("proposal_id");
    let status_raw: String = row.get("status");
    let metadata_raw: String = row.get("metadata");
    let applied_raw: String = row.get("applied_at");
    let rolled_back_raw: Option<String> = row.get("rolled_back_at");

    Ok(AppliedChange {
        change_id: super::parse_uuid(&change_id, "change_id")?,
        proposal_id: super::parse_uuid(&proposal_id, "proposal_id")?,
        store_id: row.get("store_id"),
        version_before: row.get("version_before"),
        version_after: row.get("version_after"),
        status: ChangeStatus::parse(&status_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown change status: {}", status_raw)))?,
        rollback_token: row.get("rollback_token"),
        metadata: serde_json::from_str(&metadata_raw)?,
        applied_at: super::parse_ts(&applied_raw, "applied_at")?,
        rolled_back_at: rolled_back_raw
            .map(|raw| super::parse_ts(&raw, "rolled_back_at"))
            .transpose()?,
    })
}

pub async fn get(pool: &SqlitePool, change_id: Uuid) -> Result<Option<AppliedChange>> {
    let row = sqlx::query("SELECT * FROM applied_changes WHERE change_id = ?")
        .bind(change_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Most recent change still in `applied` status for one store.
pub async fn latest_applied(pool: &SqlitePool, store_id: &str) -> Result<Option<AppliedChange>> {
    let row = sqlx::query(
        "SELECT * FROM applied_changes WHERE store_id = ? AND status = 'applied'
         ORDER BY applied_at DESC, change_id DESC LIMIT 1",
    )
    .bind(store_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

/// Flip applied -> rolled_back inside the caller's transaction, replacing
/// the change's metadata (callers record the rollback reason there). A
/// second rollback finds zero rows and surfaces as `Conflict`, never a
/// silent success.
pub async fn mark_rolled_back_tx(
    tx: &mut Transaction<'_, Sqlite>,
    change_id: Uuid,
    metadata: &serde_json::Value,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE applied_changes SET status = 'rolled_back', rolled_back_at = ?, metadata = ?
         WHERE change_id = ? AND status = 'applied'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(metadata.to_string())
    .bind(change_id.to_string())
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() != 1 {
        return Err(Error::Conflict(format!(
            "Change {} already rolled back (or unknown)",
            change_id
        )));
    }
    Ok(())
}
