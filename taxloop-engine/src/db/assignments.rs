//! CategoryAssignment persistence
//!
//! Assignments are immutable result values: insert-only, keyed (run_id, sku).

use crate::models::{CategoryAssignment, Decision};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use taxloop_common::{Error, Result};
use uuid::Uuid;

pub async fn insert_all(
    pool: &SqlitePool,
    run_id: Uuid,
    assignments: &[CategoryAssignment],
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    for assignment in assignments {
        sqlx::query(
            r#"
            INSERT INTO assignments (
                run_id, sku, category_slug, top2_slug, confidence, top2_confidence,
                margin, decision, reasons, fallback_used, contradictions, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(&assignment.sku)
        .bind(&assignment.category_slug)
        .bind(&assignment.top2_slug)
        .bind(assignment.confidence)
        .bind(assignment.top2_confidence)
        .bind(assignment.margin)
        .bind(assignment.decision.as_str())
        .bind(serde_json::to_string(&assignment.reasons)?)
        .bind(assignment.fallback_used as i64)
        .bind(assignment.contradictions as i64)
        .bind(&now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn list_for_run(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<CategoryAssignment>> {
    let rows = sqlx::query("SELECT * FROM assignments WHERE run_id = ? ORDER BY sku ASC")
        .bind(run_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let decision_raw: String = row.get("decision");
            let reasons_raw: String = row.get("reasons");
            let decision = match decision_raw.as_str() {
                "auto" => Decision::Auto,
                "review" => Decision::Review,
                other => {
                    return Err(Error::Internal(format!("Unknown decision: {}", other)));
                }
            };
            Ok(CategoryAssignment {
                sku: row.get("sku"),
                category_slug: row.get("category_slug"),
                top2_slug: row.get("top2_slug"),
                confidence: row.get("confidence"),
                top2_confidence: row.get("top2_confidence"),
                margin: row.get("margin"),
                decision,
                reasons: serde_json::from_str(&reasons_raw)?,
                fallback_used: row.get::<i64, _>("fallback_used") != 0,
                contradictions: row.get::<i64, _>("contradictions") as u32,
            })
        })
        .collect()
}
