//! Proposal persistence

use crate::models::{Proposal, ProposalKind, ProposalPayload, ProposalStatus};
use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use taxloop_common::{Error, Result};
use uuid::Uuid;

pub async fn insert(pool: &SqlitePool, proposal: &Proposal) -> Result<()> {
    let payload = serde_json::to_string(&proposal.payload)?;
    sqlx::query(
        r#"
        INSERT INTO proposals (
            proposal_id, store_id, batch_id, run_id, kind, status,
            confidence, expected_impact, payload, provenance, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(proposal.proposal_id.to_string())
    .bind(&proposal.store_id)
    .bind(proposal.batch_id.map(|id| id.to_string()))
    .bind(proposal.run_id.map(|id| id.to_string()))
    .bind(proposal.kind.as_str())
    .bind(proposal.status.as_str())
    .bind(proposal.confidence)
    .bind(proposal.expected_impact)
    .bind(&payload)
    .bind(&proposal.provenance)
    .bind(proposal.created_at.to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_all(pool: &SqlitePool, proposals: &[Proposal]) -> Result<()> {
    for proposal in proposals {
        insert(pool, proposal).await?;
    }
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Proposal> {
    let kind_raw: String = row.get("kind");
    let status_raw: String = row.get("status");
    let payload_raw: String = row.get("payload");
    let created_raw: String = row.get("created_at");
    let proposal_id_raw: String = row.get("proposal_id");
    let batch_id: Option<String> = row.get("batch_id");
    let run_id: Option<String> = row.get("run_id");

    let payload: ProposalPayload = serde_json::from_str(&payload_raw)?;

    Ok(Proposal {
        proposal_id: super::parse_uuid(&proposal_id_raw, "proposal_id")?,
        store_id: row.get("store_id"),
        batch_id: batch_id
            .map(|id| super::parse_uuid(&id, "batch_id"))
            .transpose()?,
        run_id: run_id.map(|id| super::parse_uuid(&id, "run_id")).transpose()?,
        kind: ProposalKind::parse(&kind_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown proposal kind: {}", kind_raw)))?,
        status: ProposalStatus::parse(&status_raw)
            .ok_or_else(|| Error::Internal(format!("Unknown proposal status: {}", status_raw)))?,
        confidence: row.get("confidence"),
        expected_impact: row.get("expected_impact"),
        payload,
        provenance: row.get("provenance"),
        created_at: super::parse_ts(&created_raw, "created_at")?,
    })
}

pub async fn get(pool: &SqlitePool, proposal_id: Uuid) -> Result<Option<Proposal>> {
    let row = sqlx::query("SELECT * FROM proposals WHERE proposal_id = ?")
        .bind(proposal_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Pending proposals for one store, highest expected impact first.
pub async fn list_pending(pool: &SqlitePool, store_id: &str) -> Result<Vec<Proposal>> {
    let rows = sqlx::query(
        "SELECT * FROM proposals WHERE store_id = ? AND status = 'proposed'
         ORDER BY expected_impact DESC, created_at ASC",
    )
    .bind(store_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Flip a proposal's status inside the caller's transaction. The WHERE
/// clause on the current status makes illegal transitions a `Conflict`.
pub async fn set_status_tx(
    tx: &mut Transaction<'_, Sqlite>,
    proposal_id: Uuid,
    from: ProposalStatus,
    to: ProposalStatus,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE proposals SET status = ?, updated_at = ? WHERE proposal_id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(proposal_id.to_string())
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() != 1 {
        return Err(Error::Conflict(format!(
            "Proposal {} is not in status {}",
            proposal_id,
            from.as_str()
        )));
    }
    Ok(())
}
