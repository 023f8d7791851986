//! Benchmark snapshot lifecycle
//!
//! A snapshot is a frozen, content-hashed sample of labeled products. Below
//! the configured minimum sample size it is rebuilt from the current labeled
//! catalog before any evaluation uses it.

use crate::db;
use crate::models::{BenchmarkSnapshot, Product};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use taxloop_common::{Error, Result};
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on snapshot size; labeled rows beyond it are cut by stable
/// SKU order.
const MAX_SNAPSHOT_SIZE: usize = 1_000;

/// Content hash over (sku, label) pairs in SKU order.
fn content_hash(sample: &[Product]) -> String {
    let mut hasher = Sha256::new();
    for product in sample {
        hasher.update(product.sku.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(product.label.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x1e");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Build and persist a fresh snapshot from the labeled catalog.
pub async fn build_snapshot(pool: &SqlitePool, store_id: &str) -> Result<BenchmarkSnapshot> {
    let mut labeled = db::catalog::list_labeled(pool, store_id).await?;
    if labeled.is_empty() {
        return Err(Error::InvalidInput(format!(
            "No labeled products to build a benchmark for store {}",
            store_id
        )));
    }
    labeled.sort_by(|a, b| a.sku.cmp(&b.sku));
    labeled.truncate(MAX_SNAPSHOT_SIZE);

    let snapshot = BenchmarkSnapshot {
        snapshot_id: Uuid::new_v4(),
        store_id: store_id.to_string(),
        content_hash: content_hash(&labeled),
        sample: labeled,
        created_at: Utc::now(),
    };
    db::benchmarks::insert(pool, &snapshot).await?;
    info!(
        snapshot_id = %snapshot.snapshot_id,
        sample_size = snapshot.sample.len(),
        hash = %snapshot.content_hash,
        "Built benchmark snapshot"
    );
    Ok(snapshot)
}

/// Resolve the snapshot to evaluate against: the requested one, else the
/// latest; auto-rebuilt when under `min_sample_size`.
pub async fn ensure_snapshot(
    pool: &SqlitePool,
    store_id: &str,
    snapshot_id: Option<Uuid>,
    min_sample_size: usize,
) -> Result<BenchmarkSnapshot> {
    let existing = match snapshot_id {
        Some(id) => db::benchmarks::get(pool, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Benchmark snapshot not found: {}", id)))
            .map(Some)?,
        None => db::benchmarks::latest(pool, store_id).await?,
    };

    match existing {
        Some(snapshot) if snapshot.sample.len() >= min_sample_size => Ok(snapshot),
        Some(snapshot) => {
            warn!(
                snapshot_id = %snapshot.snapshot_id,
                sample_size = snapshot.sample.len(),
                min_sample_size,
                "Benchmark snapshot under minimum size; rebuilding"
            );
            build_snapshot(pool, store_id).await
        }
        None => build_snapshot(pool, store_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn labeled(sku: &str, label: &str) -> Product {
        Product {
            sku: sku.into(),
            title: "t".into(),
            description: String::new(),
            brand: None,
            attributes: HashMap::new(),
            label: Some(label.into()),
        }
    }

    #[test]
    fn hash_depends_on_content_only() {
        let a = vec![labeled("s1", "pens"), labeled("s2", "other")];
        let b = vec![labeled("s1", "pens"), labeled("s2", "other")];
        assert_eq!(content_hash(&a), content_hash(&b));

        let c = vec![labeled("s1", "pens"), labeled("s2", "pens")];
        assert_ne!(content_hash(&a), content_hash(&c));
    }
}
