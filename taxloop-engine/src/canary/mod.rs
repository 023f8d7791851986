//! Canary subset construction
//!
//! Builds the biased sample a canary loop classifies: a deterministic
//! fixed-plus-random split over the store catalog, biased toward the most
//! recent confusion hotlist. Subset and selection report land as files in
//! the output directory; the hotlist path used is remembered in
//! `canary_state`.

mod selector;

pub use selector::{
    select_subset, SelectionParams, SelectionReport, WARN_HOTLIST_SHORTFALL, WARN_NO_HOTLIST,
};

use crate::db;
use crate::models::Product;
use crate::quality::Hotlist;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use taxloop_common::config::CanaryConfig;
use taxloop_common::{Error, Result};
use tracing::{info, warn};

/// A built subset: the products to classify plus where the artifacts went.
#[derive(Debug)]
pub struct SubsetBuild {
    pub report: SelectionReport,
    pub products: Vec<Product>,
    pub subset_path: PathBuf,
    pub report_path: PathBuf,
    pub hotlist_path: Option<PathBuf>,
}

/// Resolve the hotlist to bias selection with, in priority order: the path
/// remembered in `canary_state` (if the file still exists), else the newest
/// `confusion_hotlist_*.json` in the output directory, else none.
pub async fn resolve_hotlist_path(
    pool: &SqlitePool,
    store_id: &str,
    output_dir: &Path,
) -> Result<Option<PathBuf>> {
    if let Some(state) = db::canary_state::get(pool, store_id).await? {
        if let Some(remembered) = state.last_hotlist_path {
            let path = PathBuf::from(&remembered);
            if path.is_file() {
                return Ok(Some(path));
            }
            warn!(path = %remembered, "Remembered hotlist file is gone; scanning output dir");
        }
    }
    newest_hotlist_in(output_dir)
}

fn newest_hotlist_in(output_dir: &Path) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !(name.starts_with("confusion_hotlist_") && name.ends_with(".json")) {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified()).map_err(Error::Io)?;
        let newer = match &newest {
            Some((best, _)) => modified > *best,
            None => true,
        };
        if newer {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

pub fn load_hotlist(path: &Path) -> Result<Hotlist> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write a hotlist report file, named by run id, and remember the path.
pub async fn store_hotlist(
    pool: &SqlitePool,
    store_id: &str,
    output_dir: &Path,
    hotlist: &Hotlist,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).map_err(Error::Io)?;
    let path = output_dir.join(format!("confusion_hotlist_{}.json", hotlist.run_id));
    let json = serde_json::to_string_pretty(hotlist)?;
    std::fs::write(&path, json).map_err(Error::Io)?;
    db::canary_state::upsert(pool, store_id, None, path.to_str()).await?;
    info!(path = %path.display(), entries = hotlist.entries.len(), "Hotlist written");
    Ok(path)
}

/// Build the canary subset from the persisted catalog, write the subset
/// file (JSONL, one product per line) and the selection report, and record
/// the hotlist used in `canary_state`.
pub async fn build_subset(
    pool: &SqlitePool,
    store_id: &str,
    output_dir: &Path,
    config: &CanaryConfig,
    tag: &str,
) -> Result<SubsetBuild> {
    let catalog = db::catalog::list_for_store(pool, store_id).await?;
    if catalog.is_empty() {
        return Err(Error::InvalidInput(format!(
            "No catalog products loaded for store {}",
            store_id
        )));
    }

    let hotlist_path = resolve_hotlist_path(pool, store_id, output_dir).await?;
    let hotlist = match &hotlist_path {
        Some(path) => Some(load_hotlist(path)?),
        None => None,
    };

    let params = SelectionParams {
        sample_size: config.sample_size,
        fixed_ratio: config.fixed_ratio,
        seed: config.seed,
        store_id,
    };
    let report = select_subset(&catalog, hotlist.as_ref(), &params);
    for warning in &report.warnings {
        warn!(store_id, warning, "Canary selection warning");
    }

    let by_sku: std::collections::HashMap<&str, &Product> =
        catalog.iter().map(|p| (p.sku.as_str(), p)).collect();
    let products: Vec<Product> = report
        .selected_skus
        .iter()
        .filter_map(|sku| by_sku.get(sku.as_str()).map(|p| (*p).clone()))
        .collect();

    std::fs::create_dir_all(output_dir).map_err(Error::Io)?;
    let subset_path = output_dir.join(format!("canary_subset_{}.jsonl", tag));
    let mut lines = String::new();
    for product in &products {
        lines.push_str(&serde_json::to_string(product)?);
        lines.push('\n');
    }
    std::fs::write(&subset_path, lines).map_err(Error::Io)?;

    let report_path = output_dir.join(format!("selection_report_{}.json", tag));
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?).map_err(Error::Io)?;

    db::canary_state::upsert(
        pool,
        store_id,
        None,
        hotlist_path.as_deref().and_then(|p| p.to_str()),
    )
    .await?;

    info!(
        store_id,
        sample_size_used = report.sample_size_used,
        fixed = report.fixed_selected,
        random = report.random_selected,
        subset = %subset_path.display(),
        "Canary subset built"
    );

    Ok(SubsetBuild {
        report,
        products,
        subset_path,
        report_path,
        hotlist_path,
    })
}
