//! Confusion-pair mining
//!
//! Mines a ranked hotlist of confused category pairs from two signals:
//! QA corrections (predicted vs corrected slug) and low-margin assignments
//! (top-1 vs top-2). Hotlist severity ordering: affected count desc,
//! low-margin count desc, contradiction count desc, lexicographic pair as
//! the final tie-break.

use crate::models::{CategoryAssignment, QaCorrection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Margin below which an assignment counts as a low-margin confusion signal.
const LOW_MARGIN_FLOOR: f64 = 0.08;

/// One confused category pair with its pressure counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionEntry {
    /// Category the engine picked (or top-1 for low-margin pairs)
    pub predicted_slug: String,
    /// Category it should have been (or top-2 for low-margin pairs)
    pub corrected_slug: String,
    /// Distinct products touched by this pair
    pub affected_count: u64,
    pub low_margin_count: u64,
    pub contradiction_count: u64,
    /// A few example SKUs for canary biasing and operator review
    pub skus: Vec<String>,
}

/// Ranked hotlist for one run, serialized as a JSON report file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotlist {
    pub run_id: String,
    pub entries: Vec<ConfusionEntry>,
}

/// Max SKUs retained per entry. Enough for canary biasing without bloating
/// the report.
const MAX_SKUS_PER_ENTRY: usize = 50;

/// Mine the hotlist from one run's assignments and its QA corrections.
pub fn mine_hotlist(
    run_id: &str,
    assignments: &[CategoryAssignment],
    corrections: &[QaCorrection],
) -> Hotlist {
    #[derive(Default)]
    struct Counters {
        affected: u64,
        low_margin: u64,
        contradictions: u64,
        skus: Vec<String>,
    }

    // BTreeMap keeps pair iteration deterministic before ranking
    let mut pairs: BTreeMap<(String, String), Counters> = BTreeMap::new();

    fn touch<'a>(
        pairs: &'a mut BTreeMap<(String, String), Counters>,
        predicted: &str,
        corrected: &str,
        sku: &str,
    ) -> &'a mut Counters {
        let entry = pairs
            .entry((predicted.to_string(), corrected.to_string()))
            .or_default();
        entry.affected += 1;
        if entry.skus.len() < MAX_SKUS_PER_ENTRY && !entry.skus.iter().any(|s| s == sku) {
            entry.skus.push(sku.to_string());
        }
        entry
    }

    for correction in corrections {
        if correction.predicted_slug == correction.corrected_slug {
            continue;
        }
        touch(
            &mut pairs,
            &correction.predicted_slug,
            &correction.corrected_slug,
            &correction.sku,
        );
    }

    for assignment in assignments {
        let Some(top2) = assignment.top2_slug.as_deref() else {
            continue;
        };
        let low_margin = assignment.margin < LOW_MARGIN_FLOOR;
        if !low_margin && assignment.contradictions == 0 {
            continue;
        }
        let counters = touch(&mut pairs, &assignment.category_slug, top2, &assignment.sku);
        if low_margin {
            counters.low_margin += 1;
        }
        counters.contradictions += assignment.contradictions as u64;
    }

    let mut entries: Vec<ConfusionEntry> = pairs
        .into_iter()
        .map(|((predicted, corrected), counters)| ConfusionEntry {
            predicted_slug: predicted,
            corrected_slug: corrected,
            affected_count: counters.affected,
            low_margin_count: counters.low_margin,
            contradiction_count: counters.contradictions,
            skus: counters.skus,
        })
        .collect();

    entries.sort_by(|a, b| {
        b.affected_count
            .cmp(&a.affected_count)
            .then(b.low_margin_count.cmp(&a.low_margin_count))
            .then(b.contradiction_count.cmp(&a.contradiction_count))
            .then_with(|| {
                (a.predicted_slug.as_str(), a.corrected_slug.as_str())
                    .cmp(&(b.predicted_slug.as_str(), b.corrected_slug.as_str()))
            })
    });

    Hotlist {
        run_id: run_id.to_string(),
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Decision;
    use chrono::Utc;
    use uuid::Uuid;

    fn correction(sku: &str, predicted: &str, corrected: &str) -> QaCorrection {
        QaCorrection {
            correction_id: Uuid::new_v4(),
            store_id: "store-1".into(),
            run_id: None,
            sku: sku.into(),
            predicted_slug: predicted.into(),
            corrected_slug: corrected.into(),
            notes: None,
            created_at: Utc::now(),
        }
    }

    fn low_margin_assignment(sku: &str, top1: &str, top2: &str) -> CategoryAssignment {
        CategoryAssignment {
            sku: sku.into(),
            category_slug: top1.into(),
            top2_slug: Some(top2.into()),
            confidence: 0.5,
            top2_confidence: 0.48,
            margin: 0.02,
            decision: Decision::Review,
            reasons: vec![],
            fallback_used: false,
            contradictions: 0,
        }
    }

    #[test]
    fn ranking_order() {
        let corrections = vec![
            correction("s1", "pens", "markers"),
            correction("s2", "pens", "markers"),
            correction("s3", "notebooks", "planners"),
        ];
        let assignments = vec![
            low_margin_assignment("s4", "notebooks", "planners"),
            low_margin_assignment("s5", "erasers", "sharpeners"),
        ];

        let hotlist = mine_hotlist("run-1", &assignments, &corrections);
        // pens/markers: affected 2; notebooks/planners: affected 2 but one
        // low-margin; low-margin count breaks the tie in its favor
        assert_eq!(hotlist.entries[0].predicted_slug, "notebooks");
        assert_eq!(hotlist.entries[0].low_margin_count, 1);
        assert_eq!(hotlist.entries[1].predicted_slug, "pens");
        assert_eq!(hotlist.entries[2].predicted_slug, "erasers");
    }

    #[test]
    fn lexicographic_final_tie_break() {
        let corrections = vec![
            correction("s1", "zeta", "alpha"),
            correction("s2", "alpha", "beta"),
        ];
        let hotlist = mine_hotlist("run-1", &[], &corrections);
        assert_eq!(hotlist.entries[0].predicted_slug, "alpha");
        assert_eq!(hotlist.entries[1].predicted_slug, "zeta");
    }

    #[test]
    fn identical_correction_is_ignored() {
        let corrections = vec![correction("s1", "pens", "pens")];
        let hotlist = mine_hotlist("run-1", &[], &corrections);
        assert!(hotlist.entries.is_empty());
    }
}
