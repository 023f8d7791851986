//! Deterministic biased subset selection
//!
//! A fixed portion of the sample comes from the highest-severity confusion
//! hotlist rows; the remainder is random-but-deterministic, ranked by a
//! stable hash of (seed, store_id, sku). Same inputs always produce the
//! same subset.

use crate::models::Product;
use crate::quality::Hotlist;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Warning codes recorded on the selection report.
pub const WARN_HOTLIST_SHORTFALL: &str = "hotlist_shortfall_backfilled";
pub const WARN_NO_HOTLIST: &str = "no_hotlist_available";

#[derive(Debug, Clone, Copy)]
pub struct SelectionParams<'a> {
    pub sample_size: usize,
    pub fixed_ratio: f64,
    pub seed: u64,
    pub store_id: &'a str,
}

/// Selection outcome, serialized as the selection report file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionReport {
    pub store_id: String,
    pub seed: u64,
    pub sample_size_requested: usize,
    pub sample_size_used: usize,
    pub fixed_target: usize,
    pub fixed_selected: usize,
    pub random_selected: usize,
    pub selected_skus: Vec<String>,
    pub warnings: Vec<String>,
}

/// Stable rank of one SKU under (seed, store_id): first 8 bytes of
/// sha256(seed_le || store_id || sku) as a big-endian u64.
fn stable_rank(seed: u64, store_id: &str, sku: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(store_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(sku.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Select the canary subset from a deduplicated catalog.
///
/// The hotlist is assumed already ranked by severity (affected desc,
/// low-margin desc, contradiction desc, lexicographic pair). A hotlist
/// shortfall backfills silently from the random pool with a warning; a
/// missing hotlist yields a 100% random selection with a distinct warning.
pub fn select_subset(
    catalog: &[Product],
    hotlist: Option<&Hotlist>,
    params: &SelectionParams<'_>,
) -> SelectionReport {
    // Dedupe by SKU, first occurrence wins, preserving input order
    let mut seen = HashSet::new();
    let available: Vec<&Product> = catalog
        .iter()
        .filter(|p| seen.insert(p.sku.as_str()))
        .collect();
    let catalog_skus: HashSet<&str> = available.iter().map(|p| p.sku.as_str()).collect();

    let sample_size_used = params.sample_size.min(available.len());
    let fixed_target = ((sample_size_used as f64) * params.fixed_ratio).round() as usize;
    let fixed_target = fixed_target.min(sample_size_used);

    let mut warnings = Vec::new();
    let mut selected: Vec<String> = Vec::with_capacity(sample_size_used);
    let mut selected_set: HashSet<String> = HashSet::with_capacity(sample_size_used);

    // Fixed portion: walk hotlist entries in severity order
    match hotlist {
        Some(hotlist) => {
            'outer: for entry in &hotlist.entries {
                for sku in &entry.skus {
                    if selected.len() >= fixed_target {
                        break 'outer;
                    }
                    if !catalog_skus.contains(sku.as_str()) {
                        continue; // hotlist SKU no longer in the catalog
                    }
                    if selected_set.insert(sku.clone()) {
                        selected.push(sku.clone());
                    }
                }
            }
            if selected.len() < fixed_target {
                warnings.push(WARN_HOTLIST_SHORTFALL.to_string());
            }
        }
        None => {
            warnings.push(WARN_NO_HOTLIST.to_string());
        }
    }
    let fixed_selected = selected.len();

    // Random remainder: lowest stable rank first
    let mut ranked: Vec<(&str, u64)> = available
        .iter()
        .filter(|p| !selected_set.contains(&p.sku))
        .map(|p| (p.sku.as_str(), stable_rank(params.seed, params.store_id, &p.sku)))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    for (sku, _) in ranked {
        if selected.len() >= sample_size_used {
            break;
        }
        selected_set.insert(sku.to_string());
        selected.push(sku.to_string());
    }
    let random_selected = selected.len() - fixed_selected;

    SelectionReport {
        store_id: params.store_id.to_string(),
        seed: params.seed,
        sample_size_requested: params.sample_size,
        sample_size_used,
        fixed_target,
        fixed_selected,
        random_selected,
        selected_skus: selected,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::ConfusionEntry;
    use std::collections::HashMap;

    fn catalog(n: usize) -> Vec<Product> {
        (0..n)
            .map(|i| Product {
                sku: format!("sku-{:04}", i),
                title: format!("product {}", i),
                description: String::new(),
                brand: None,
                attributes: HashMap::new(),
                label: None,
            })
            .collect()
    }

    fn hotlist_with_skus(skus: Vec<String>) -> Hotlist {
        Hotlist {
            run_id: "run-1".into(),
            entries: vec![ConfusionEntry {
                predicted_slug: "a".into(),
                corrected_slug: "b".into(),
                affected_count: skus.len() as u64,
                low_margin_count: 0,
                contradiction_count: 0,
                skus,
            }],
        }
    }

    fn params(sample_size: usize, fixed_ratio: f64) -> SelectionParams<'static> {
        SelectionParams {
            sample_size,
            fixed_ratio,
            seed: 42,
            store_id: "store-1",
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let products = catalog(100);
        let hotlist = hotlist_with_skus((0..30).map(|i| format!("sku-{:04}", i)).collect());
        let p = params(50, 0.3);

        let first = select_subset(&products, Some(&hotlist), &p);
        let second = select_subset(&products, Some(&hotlist), &p);
        assert_eq!(first.selected_skus, second.selected_skus);
        assert_eq!(first.fixed_selected, second.fixed_selected);
        assert_eq!(first.random_selected, second.random_selected);
    }

    #[test]
    fn conservation() {
        let products = catalog(80);
        let report = select_subset(&products, None, &params(100, 0.3));
        assert_eq!(report.sample_size_used, 80);
        assert_eq!(
            report.fixed_selected + report.random_selected,
            report.sample_size_used
        );
    }

    #[test]
    fn shortfall_backfills_with_warning() {
        let products = catalog(100);
        // Only 5 hotlist SKUs against a fixed target of 15
        let hotlist = hotlist_with_skus((0..5).map(|i| format!("sku-{:04}", i)).collect());
        let report = select_subset(&products, Some(&hotlist), &params(50, 0.3));

        assert_eq!(report.fixed_target, 15);
        assert_eq!(report.fixed_selected, 5);
        assert_eq!(report.random_selected, 45);
        assert_eq!(report.selected_skus.len(), 50);
        assert!(report.warnings.contains(&WARN_HOTLIST_SHORTFALL.to_string()));
    }

    #[test]
    fn no_hotlist_is_fully_random_with_distinct_warning() {
        let products = catalog(100);
        let report = select_subset(&products, None, &params(50, 0.3));
        assert_eq!(report.fixed_selected, 0);
        assert_eq!(report.random_selected, 50);
        assert_eq!(report.warnings, vec![WARN_NO_HOTLIST.to_string()]);
    }

    #[test]
    fn hotlist_skus_missing_from_catalog_are_skipped() {
        let products = catalog(10);
        let hotlist = hotlist_with_skus(vec!["ghost-1".into(), "sku-0003".into()]);
        let report = select_subset(&products, Some(&hotlist), &params(10, 0.2));
        assert_eq!(report.fixed_selected, 1);
        assert!(report.selected_skus.contains(&"sku-0003".to_string()));
    }

    #[test]
    fn duplicate_catalog_rows_are_deduplicated() {
        let mut products = catalog(10);
        products.extend(catalog(10)); // every SKU twice
        let report = select_subset(&products, None, &params(100, 0.5));
        assert_eq!(report.sample_size_used, 10);
        let unique: HashSet<&String> = report.selected_skus.iter().collect();
        assert_eq!(unique.len(), report.selected_skus.len());
    }

    #[test]
    fn end_to_end_500_products() {
        let products = catalog(500);
        let hotlist = hotlist_with_skus((0..200).map(|i| format!("sku-{:04}", i)).collect());
        let p = params(350, 0.3);

        let report = select_subset(&products, Some(&hotlist), &p);
        assert_eq!(report.sample_size_used, 350);
        assert_eq!(report.fixed_target, 105);
        assert_eq!(report.fixed_selected, 105);
        assert_eq!(report.random_selected, 245);
        assert!(report.warnings.is_empty());

        let again = select_subset(&products, Some(&hotlist), &p);
        assert_eq!(report.selected_skus, again.selected_skus);
    }
}
