//! Rule-change and threshold-change proposal mining
//!
//! Three miners feed one candidate pool:
//! - term mining: the most frequent unseen content token among each corrected
//!   category's rows becomes a `rule_term_add`
//! - threshold tuning: a failed gate metric nudges the top offending
//!   category's gate by one fixed step in the safe direction, hard-clamped
//! - structural probes: pairs under combined low-margin + contradiction
//!   pressure above a fixed floor emit low-confidence `taxonomy_merge` probes
//!
//! Candidates are truncated to a configurable maximum, sorted by expected
//! impact descending.

use crate::engine::scoring::tokenize;
use crate::models::{
    Product, Proposal, ProposalKind, ProposalPayload, ProposalStatus, QaCorrection, RuleAction,
    RuleField,
};
use crate::quality::{ConfusionEntry, Hotlist};
use crate::taxonomy::TaxonomyDoc;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Fixed nudge applied by threshold tuning.
pub const THRESHOLD_STEP: f64 = 0.02;

/// Hard clamp for tuned thresholds.
const THRESHOLD_MIN: f64 = 0.05;
const THRESHOLD_MAX: f64 = 0.95;

/// Combined pressure floor for merge probes.
const STRUCTURAL_PRESSURE_FLOOR: u64 = 5;

/// Tokens too generic to mine as rule terms.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "pack", "set", "new", "pcs", "piece", "pieces", "size", "color",
    "colour", "free", "premium", "quality", "best", "sale",
];

/// Everything one generator pass reads, scoped to a run/batch.
pub struct GeneratorInput<'a> {
    pub store_id: &'a str,
    pub batch_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub doc: &'a TaxonomyDoc,
    /// QA-corrected rows with their product text
    pub corrections: &'a [(QaCorrection, Product)],
    pub hotlist: Option<&'a Hotlist>,
    /// Gate metric names that failed on the last evaluation
    pub failed_gate_metrics: &'a [String],
    pub max_proposals: usize,
}

/// Run all miners and return the scored, truncated proposal list.
pub fn generate_proposals(input: &GeneratorInput<'_>) -> Vec<Proposal> {
    let mut candidates = Vec::new();

    candidates.extend(mine_terms(input));
    candidates.extend(tune_thresholds(input));
    candidates.extend(merge_probes(input));

    candidates.sort_by(|a, b| {
        b.expected_impact
            .partial_cmp(&a.expected_impact)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(input.max_proposals);
    candidates
}

fn new_proposal(
    input: &GeneratorInput<'_>,
    kind: ProposalKind,
    confidence: f64,
    expected_impact: f64,
    payload: ProposalPayload,
    provenance: &str,
) -> Proposal {
    Proposal {
        proposal_id: Uuid::new_v4(),
        store_id: input.store_id.to_string(),
        batch_id: input.batch_id,
        run_id: input.run_id,
        kind,
        status: ProposalStatus::Proposed,
        confidence,
        expected_impact,
        payload,
        provenance: provenance.to_string(),
        created_at: Utc::now(),
    }
}

/// Per corrected-category term mining.
fn mine_terms(input: &GeneratorInput<'_>) -> Vec<Proposal> {
    // corrected slug -> token -> count across that category's corrected rows
    let mut token_counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    let mut row_counts: BTreeMap<String, u64> = BTreeMap::new();

    for (correction, product) in input.corrections {
        if correction.predicted_slug == correction.corrected_slug {
            continue;
        }
        if input.doc.category(&correction.corrected_slug).is_none() {
            // Unknown target category: skip the row, never fail the pass
            continue;
        }
        *row_counts.entry(correction.corrected_slug.clone()).or_default() += 1;

        let counts = token_counts
            .entry(correction.corrected_slug.clone())
            .or_default();
        let tokens: HashSet<String> =
            tokenize(&format!("{} {}", product.title, product.description))
                .into_iter()
                .collect();
        for token in tokens {
            if token.len() < 3 || STOPWORDS.contains(&token.as_str()) {
                continue;
            }
            *counts.entry(token).or_default() += 1;
        }
    }

    let mut proposals = Vec::new();
    for (slug, counts) in token_counts {
        let existing: HashSet<String> = input
            .doc
            .rule(&slug)
            .map(|rule| {
                rule.include_any
                    .iter()
                    .chain(rule.include_all.iter())
                    .map(|t| t.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        // Most frequent unseen token; ties resolve alphabetically via the
        // BTreeMap iteration order
        let best = counts
            .iter()
            .filter(|(token, _)| !existing.contains(*token))
            .max_by_key(|(_, count)| **count);

        let Some((token, count)) = best else {
            continue;
        };
        let rows = row_counts.get(&slug).copied().unwrap_or(1);
        let support = *count as f64 / rows as f64;

        proposals.push(new_proposal(
            input,
            ProposalKind::RuleTermAdd,
            (0.4 + 0.5 * support).min(0.9),
            *count as f64,
            ProposalPayload {
                target_slug: slug.clone(),
                field: RuleField::IncludeAny,
                action: RuleAction::Add,
                value: serde_json::Value::String(token.clone()),
                reason: format!(
                    "term '{}' appears in {}/{} QA-corrected rows for '{}'",
                    token, count, rows, slug
                ),
            },
            "qa_term_mining",
        ));
    }
    proposals
}

/// Threshold tuning for failed gate metrics.
fn tune_thresholds(input: &GeneratorInput<'_>) -> Vec<Proposal> {
    let Some(hotlist) = input.hotlist else {
        return Vec::new();
    };
    let Some(top_entry) = hotlist.entries.first() else {
        return Vec::new();
    };

    let mut proposals = Vec::new();
    for metric in input.failed_gate_metrics {
        // Safe direction per metric: a too-high fallback or review rate
        // wants a lower confidence gate; a failing auto rate wants a lower
        // margin gate.
        let (field, current, step_down) = match metric.as_str() {
            "auto_accepted_rate" => {
                let current = input
                    .doc
                    .rule(&top_entry.predicted_slug)
                    .and_then(|r| r.auto_min_margin)
                    .unwrap_or(0.10);
                (RuleField::AutoMinMargin, current, true)
            }
            "needs_review_rate" | "fallback_category_rate" => {
                let current = input
                    .doc
                    .rule(&top_entry.predicted_slug)
                    .and_then(|r| r.auto_min_confidence)
                    .unwrap_or(0.70);
                (RuleField::AutoMinConfidence, current, true)
            }
            _ => continue,
        };

        let target = if step_down {
            (current - THRESHOLD_STEP).clamp(THRESHOLD_MIN, THRESHOLD_MAX)
        } else {
            (current + THRESHOLD_STEP).clamp(THRESHOLD_MIN, THRESHOLD_MAX)
        };

        if (target - current).abs() < f64::EPSILON {
            continue; // already clamped at the boundary
        }

        proposals.push(new_proposal(
            input,
            ProposalKind::ThresholdTune,
            0.5,
            top_entry.affected_count as f64 * 0.5,
            ProposalPayload {
                target_slug: top_entry.predicted_slug.clone(),
                field,
                action: RuleAction::Set,
                value: serde_json::json!(target),
                reason: format!("gate metric '{}' failed; nudging {:?} toward {:.2}", metric, field, target),
            },
            "threshold_tuning",
        ));
    }
    proposals
}

/// Low-confidence merge probes from high-pressure confusion pairs.
fn merge_probes(input: &GeneratorInput<'_>) -> Vec<Proposal> {
    let Some(hotlist) = input.hotlist else {
        return Vec::new();
    };

    hotlist
        .entries
        .iter()
        .filter(|entry| pressure(entry) >= STRUCTURAL_PRESSURE_FLOOR)
        .map(|entry| {
            new_proposal(
                input,
                ProposalKind::TaxonomyMerge,
                0.2,
                pressure(entry) as f64 * 0.25,
                ProposalPayload {
                    target_slug: entry.predicted_slug.clone(),
                    field: RuleField::IncludeAny,
                    action: RuleAction::Set,
                    value: serde_json::json!({
                        "merge_into": entry.predicted_slug,
                        "merge_from": entry.corrected_slug,
                    }),
                    reason: format!(
                        "sustained confusion pressure between '{}' and '{}' ({} low-margin, {} contradictions)",
                        entry.predicted_slug,
                        entry.corrected_slug,
                        entry.low_margin_count,
                        entry.contradiction_count
                    ),
                },
                "confusion_merge_probe",
            )
        })
        .collect()
}

fn pressure(entry: &ConfusionEntry) -> u64 {
    entry.low_margin_count + entry.contradiction_count
}
