//! Per-run quality metrics

use crate::models::{CategoryAssignment, Decision, RunMetrics};
use std::collections::HashMap;

/// A rate gate passes iff the observed rate meets its threshold.
pub fn is_gate_passing(rate: f64, threshold: f64) -> bool {
    rate >= threshold
}

/// Reduce one run's assignments into metrics.
///
/// `labels` maps SKU to ground-truth slug (benchmark labels or QA-corrected
/// categories). Accuracy tiers are computed over labeled rows only:
/// - L1: exact top-1 match
/// - L2: label within {top-1, top-2}
/// - L3: L2, or the row was routed to review (a reviewed miss is not an
///   auto-acceptance error)
pub fn compute_run_metrics(
    assignments: &[CategoryAssignment],
    labels: &HashMap<String, String>,
    fallback_slug: &str,
) -> RunMetrics {
    let total = assignments.len();
    if total == 0 {
        return RunMetrics::default();
    }

    let mut auto = 0usize;
    let mut review = 0usize;
    let mut fallback = 0usize;
    let mut labeled = 0usize;
    let mut l1 = 0usize;
    let mut l2 = 0usize;
    let mut l3 = 0usize;

    for assignment in assignments {
        match assignment.decision {
            Decision::Auto => auto += 1,
            Decision::Review => review += 1,
        }
        if assignment.category_slug == fallback_slug {
            fallback += 1;
        }

        if let Some(label) = labels.get(&assignment.sku) {
            labeled += 1;
            let top1_hit = &assignment.category_slug == label;
            let top2_hit =
                top1_hit || assignment.top2_slug.as_deref() == Some(label.as_str());
            if top1_hit {
                l1 += 1;
            }
            if top2_hit {
                l2 += 1;
            }
            if top2_hit || assignment.decision == Decision::Review {
                l3 += 1;
            }
        }
    }

    let rate = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f64 / d as f64 };

    RunMetrics {
        total,
        auto_accepted_rate: rate(auto, total),
        needs_review_rate: rate(review, total),
        fallback_category_rate: rate(fallback, total),
        accuracy_l1: rate(l1, labeled),
        accuracy_l2: rate(l2, labeled),
        accuracy_l3: rate(l3, labeled),
        labeled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(sku: &str, slug: &str, top2: &str, decision: Decision) -> CategoryAssignment {
        CategoryAssignment {
            sku: sku.into(),
            category_slug: slug.into(),
            top2_slug: Some(top2.into()),
            confidence: 0.8,
            top2_confidence: 0.4,
            margin: 0.4,
            decision,
            reasons: vec![],
            fallback_used: slug == "other",
            contradictions: 0,
        }
    }

    #[test]
    fn gate_monotonicity() {
        for i in 0..=10 {
            for j in 0..=10 {
                let rate = i as f64 / 10.0;
                let threshold = j as f64 / 10.0;
                assert_eq!(is_gate_passing(rate, threshold), rate >= threshold);
            }
        }
    }

    #[test]
    fn accuracy_tiers() {
        let assignments = vec![
            assignment("s1", "pens", "notebooks", Decision::Auto), // L1
            assignment("s2", "notebooks", "pens", Decision::Auto), // L2 via top-2
            assignment("s3", "other", "notebooks", Decision::Review), // L3 via review
            assignment("s4", "other", "erasers", Decision::Auto),  // miss
        ];
        let labels = HashMap::from([
            ("s1".to_string(), "pens".to_string()),
            ("s2".to_string(), "pens".to_string()),
            ("s3".to_string(), "pens".to_string()),
            ("s4".to_string(), "pens".to_string()),
        ]);

        let metrics = compute_run_metrics(&assignments, &labels, "other");
        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.labeled, 4);
        assert!((metrics.accuracy_l1 - 0.25).abs() < 1e-9);
        assert!((metrics.accuracy_l2 - 0.5).abs() < 1e-9);
        assert!((metrics.accuracy_l3 - 0.75).abs() < 1e-9);
        assert!((metrics.fallback_category_rate - 0.5).abs() < 1e-9);
        assert!((metrics.needs_review_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn empty_run_yields_default_metrics() {
        let metrics = compute_run_metrics(&[], &HashMap::new(), "other");
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.auto_accepted_rate, 0.0);
    }
}
