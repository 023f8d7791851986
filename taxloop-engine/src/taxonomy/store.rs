//! Versioned taxonomy store handle
//!
//! Explicit handle passed by reference into every component (no process-wide
//! singleton). Every read returns the version it observed; every mutation
//! inserts a new version row and advances the head pointer with a conditional
//! UPDATE, so a writer holding a stale parent version fails with `Conflict`
//! instead of overwriting.

use super::TaxonomyDoc;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use taxloop_common::{Error, Result};
use tracing::info;

/// Version id of an empty, never-mutated store.
pub const GENESIS_VERSION: &str = "genesis";

/// versionAfter = f(versionBefore, proposalId). Opaque, monotone, never
/// reused for distinct (parent, proposal) pairs.
pub fn chain_version(version_before: &str, proposal_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version_before.as_bytes());
    hasher.update(b":");
    hasher.update(proposal_id.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

#[derive(Clone)]
pub struct TaxonomyStore {
    pool: SqlitePool,
    store_id: String,
}

impl TaxonomyStore {
    pub fn new(pool: SqlitePool, store_id: impl Into<String>) -> Self {
        Self {
            pool,
            store_id: store_id.into(),
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Seed the store with an initial document. Fails if a head already exists.
    pub async fn initialize(&self, doc: &TaxonomyDoc) -> Result<String> {
        doc.validate()?;
        let version = chain_version(GENESIS_VERSION, "init");
        let now = Utc::now().to_rfc3339();
        let doc_json = serde_json::to_string(doc)?;

        let mut tx = self.pool.begin().await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT version FROM taxonomy_heads WHERE store_id = ?")
                .bind(&self.store_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(Error::Conflict(format!(
                "Store {} already initialized",
                self.store_id
            )));
        }

        sqlx::query(
            "INSERT INTO taxonomy_versions (store_id, version, parent_version, proposal_id, doc, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.store_id)
        .bind(&version)
        .bind(GENESIS_VERSION)
        .bind("init")
        .bind(&doc_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO taxonomy_heads (store_id, version, updated_at) VALUES (?, ?, ?)")
            .bind(&self.store_id)
            .bind(&version)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(store_id = %self.store_id, version = %version, "Taxonomy store initialized");
        Ok(version)
    }

    /// Load the head version and its validated document.
    pub async fn load_current(&self) -> Result<(String, TaxonomyDoc)> {
        let version: String =
            sqlx::query_scalar("SELECT version FROM taxonomy_heads WHERE store_id = ?")
                .bind(&self.store_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("Taxonomy store not initialized: {}", self.store_id))
                })?;

        let doc = self.load_version(&version).await?;
        Ok((version, doc))
    }

    /// Load one specific version's document.
    pub async fn load_version(&self, version: &str) -> Result<TaxonomyDoc> {
        let row = sqlx::query(
            "SELECT doc FROM taxonomy_versions WHERE store_id = ? AND version = ?",
        )
        .bind(&self.store_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "Taxonomy version not found: {} @ {}",
                self.store_id, version
            ))
        })?;

        let doc_json: String = row.get("doc");
        let doc: TaxonomyDoc = serde_json::from_str(&doc_json)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Raw document JSON for one version. Used by the rollback round-trip
    /// guarantee: restoring a version must reproduce byte-identical content.
    pub async fn version_content(&self, version: &str) -> Result<String> {
        let content: Option<String> = sqlx::query_scalar(
            "SELECT doc FROM taxonomy_versions WHERE store_id = ? AND version = ?",
        )
        .bind(&self.store_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        content.ok_or_else(|| {
            Error::NotFound(format!(
                "Taxonomy version not found: {} @ {}",
                self.store_id, version
            ))
        })
    }

    /// Insert a new version chained from `version_before` and advance the
    /// head, inside the caller's transaction. The conditional head UPDATE is
    /// the compare-and-set that serializes concurrent applies.
    pub async fn put_version_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        version_before: &str,
        proposal_id: &str,
        doc_json: &str,
    ) -> Result<String> {
        let version_after = chain_version(version_before, proposal_id);
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO taxonomy_versions (store_id, version, parent_version, proposal_id, doc, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.store_id)
        .bind(&version_after)
        .bind(version_before)
        .bind(proposal_id)
        .bind(doc_json)
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE taxonomy_heads SET version = ?, updated_at = ? WHERE store_id = ? AND version = ?",
        )
        .bind(&version_after)
        .bind(&now)
        .bind(&self.store_id)
        .bind(version_before)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(Error::Conflict(format!(
                "Stale taxonomy version: head moved past {}",
                version_before
            )));
        }

        Ok(version_after)
    }

    /// Move the head back to a previously stored version, inside the
    /// caller's transaction. No new version row: the restored content is the
    /// original row, byte-identical.
    pub async fn restore_version_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        expected_head: &str,
        restore_to: &str,
    ) -> Result<()> {
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT version FROM taxonomy_versions WHERE store_id = ? AND version = ?",
        )
        .bind(&self.store_id)
        .bind(restore_to)
        .fetch_optional(&mut **tx)
        .await?;
        if exists.is_none() {
            return Err(Error::NotFound(format!(
                "Cannot restore unknown version: {}",
                restore_to
            )));
        }

        let updated = sqlx::query(
            "UPDATE taxonomy_heads SET version = ?, updated_at = ? WHERE store_id = ? AND version = ?",
        )
        .bind(restore_to)
        .bind(Utc::now().to_rfc3339())
        .bind(&self.store_id)
        .bind(expected_head)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(Error::Conflict(format!(
                "Stale taxonomy version on restore: head moved past {}",
                expected_head
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_versions_are_stable_and_distinct() {
        let v1 = chain_version(GENESIS_VERSION, "p1");
        let v1_again = chain_version(GENESIS_VERSION, "p1");
        let v2 = chain_version(&v1, "p2");

        assert_eq!(v1, v1_again);
        assert_ne!(v1, v2);
        assert_eq!(v1.len(), 16);
        assert!(v1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_proposals_chain_differently() {
        assert_ne!(chain_version("abc", "p1"), chain_version("abc", "p2"));
    }
}
