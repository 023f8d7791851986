//! Append-only run log
//!
//! Structured events (level/stage/event/payload) persisted alongside the
//! tracing output. The writer is best-effort: a failed insert logs a warning
//! and returns Ok, so log-flush problems can never abort business logic.

use crate::Result;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

/// Log level for run-log rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Run-log writer scoped to one store.
#[derive(Clone)]
pub struct RunLogWriter {
    pool: SqlitePool,
    store_id: String,
}

impl RunLogWriter {
    pub fn new(pool: SqlitePool, store_id: impl Into<String>) -> Self {
        Self {
            pool,
            store_id: store_id.into(),
        }
    }

    /// Append one event. Best-effort: never returns an error.
    pub async fn append(
        &self,
        level: LogLevel,
        stage: &str,
        event: &str,
        batch_id: Option<Uuid>,
        run_id: Option<Uuid>,
        payload: Option<serde_json::Value>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO run_log (store_id, batch_id, run_id, level, stage, event, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.store_id)
        .bind(batch_id.map(|id| id.to_string()))
        .bind(run_id.map(|id| id.to_string()))
        .bind(level.as_str())
        .bind(stage)
        .bind(event)
        .bind(payload.map(|p| p.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(stage, event, "Run-log write failed (ignored): {}", e);
        }
    }

    /// Delete rows older than the retention window. Returns deleted count.
    pub async fn expire_older_than(&self, retention_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        let result = sqlx::query("DELETE FROM run_log WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::schema::create_all_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn append_and_expire() {
        let pool = test_pool().await;
        let writer = RunLogWriter::new(pool.clone(), "store-1");

        writer
            .append(LogLevel::Info, "apply", "proposal_applied", None, None, None)
            .await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM run_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Nothing is old enough to expire yet
        let deleted = writer.expire_older_than(30).await.unwrap();
        assert_eq!(deleted, 0);

        // Backdate the row and sweep again
        sqlx::query("UPDATE run_log SET created_at = '2000-01-01T00:00:00+00:00'")
            .execute(&pool)
            .await
            .unwrap();
        let deleted = writer.expire_older_than(30).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn append_survives_missing_table() {
        // No schema bootstrap: insert fails, append still returns normally
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let writer = RunLogWriter::new(pool, "store-1");
        writer
            .append(LogLevel::Error, "canary", "noop", None, None, None)
            .await;
    }
}
