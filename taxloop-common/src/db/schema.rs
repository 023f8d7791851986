//! Table schemas
//!
//! One `CREATE TABLE IF NOT EXISTS` per entity. Timestamps are RFC3339 TEXT,
//! ids are UUID TEXT, structured payloads are serialized JSON TEXT.

use crate::Result;
use sqlx::SqlitePool;

/// Create every table and index used by the workspace. Idempotent.
pub async fn create_all_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS taxonomy_versions (
            store_id        TEXT NOT NULL,
            version         TEXT NOT NULL,
            parent_version  TEXT,
            proposal_id     TEXT,
            doc             TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (store_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One head row per store; conditional UPDATE on this row is the
    // compare-and-set that serializes applies.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS taxonomy_heads (
            store_id    TEXT PRIMARY KEY,
            version     TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proposals (
            proposal_id     TEXT PRIMARY KEY,
            store_id        TEXT NOT NULL,
            batch_id        TEXT,
            run_id          TEXT,
            kind            TEXT NOT NULL,
            status          TEXT NOT NULL,
            confidence      REAL NOT NULL,
            expected_impact REAL NOT NULL,
            payload         TEXT NOT NULL,
            provenance      TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_proposals_status
         ON proposals (store_id, status, expected_impact)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS applied_changes (
            change_id       TEXT PRIMARY KEY,
            proposal_id     TEXT NOT NULL,
            store_id        TEXT NOT NULL,
            version_before  TEXT NOT NULL,
            version_after   TEXT NOT NULL,
            status          TEXT NOT NULL,
            rollback_token  TEXT NOT NULL,
            metadata        TEXT NOT NULL,
            applied_at      TEXT NOT NULL,
            rolled_back_at  TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS benchmark_snapshots (
            snapshot_id   TEXT PRIMARY KEY,
            store_id      TEXT NOT NULL,
            content_hash  TEXT NOT NULL,
            sample        TEXT NOT NULL,
            sample_size   INTEGER NOT NULL,
            created_at    TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harness_runs (
            harness_run_id   TEXT PRIMARY KEY,
            store_id         TEXT NOT NULL,
            candidate_run_id TEXT NOT NULL,
            baseline_run_id  TEXT NOT NULL,
            snapshot_id      TEXT NOT NULL,
            passed           INTEGER NOT NULL,
            scores           TEXT NOT NULL,
            failed_metrics   TEXT NOT NULL,
            created_at       TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            batch_id        TEXT PRIMARY KEY,
            store_id        TEXT NOT NULL,
            loop_type       TEXT NOT NULL,
            loop_count      INTEGER NOT NULL,
            retry_limit     INTEGER NOT NULL,
            structural_cap  INTEGER NOT NULL,
            auto_apply      INTEGER NOT NULL,
            status          TEXT NOT NULL,
            failure_reason  TEXT,
            summary         TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            started_at      TEXT,
            ended_at        TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batches_status
         ON batches (status, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id          TEXT PRIMARY KEY,
            batch_id        TEXT NOT NULL,
            store_id        TEXT NOT NULL,
            sequence_no     INTEGER NOT NULL,
            attempt_no      INTEGER NOT NULL,
            status          TEXT NOT NULL,
            failure_reason  TEXT,
            metrics         TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            started_at      TEXT,
            ended_at        TEXT,
            UNIQUE (batch_id, sequence_no, attempt_no)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assignments (
            run_id          TEXT NOT NULL,
            sku             TEXT NOT NULL,
            category_slug   TEXT NOT NULL,
            top2_slug       TEXT,
            confidence      REAL NOT NULL,
            top2_confidence REAL NOT NULL,
            margin          REAL NOT NULL,
            decision        TEXT NOT NULL,
            reasons         TEXT NOT NULL,
            fallback_used   INTEGER NOT NULL,
            contradictions  INTEGER NOT NULL,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (run_id, sku)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            store_id    TEXT NOT NULL,
            sku         TEXT NOT NULL,
            title       TEXT NOT NULL,
            description TEXT NOT NULL,
            brand       TEXT,
            attributes  TEXT NOT NULL,
            label       TEXT,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (store_id, sku)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS qa_corrections (
            correction_id  TEXT PRIMARY KEY,
            store_id       TEXT NOT NULL,
            run_id         TEXT,
            sku            TEXT NOT NULL,
            predicted_slug TEXT NOT NULL,
            corrected_slug TEXT NOT NULL,
            notes          TEXT,
            created_at     TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canary_state (
            store_id          TEXT PRIMARY KEY,
            last_run_id       TEXT,
            last_hotlist_path TEXT,
            updated_at        TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id    TEXT,
            batch_id    TEXT,
            run_id      TEXT,
            level       TEXT NOT NULL,
            stage       TEXT NOT NULL,
            event       TEXT NOT NULL,
            payload     TEXT,
            created_at  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_run_log_created
         ON run_log (created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
