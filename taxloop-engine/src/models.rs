//! Domain model types shared across components
//!
//! Entities mirror the database tables one-to-one; structured payloads are
//! stored as JSON columns and round-trip through these serde types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One normalized product listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub brand: Option<String>,
    /// Extracted attribute tokens, e.g. "format" -> "a5", "ruling" -> "dotted"
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Ground-truth category slug when known (benchmark/labeled rows)
    #[serde(default)]
    pub label: Option<String>,
}

/// Read products from a JSON-lines file, one object per non-empty line.
/// A malformed line fails the whole read with its line number.
pub fn read_products_jsonl(path: &std::path::Path) -> taxloop_common::Result<Vec<Product>> {
    let content = std::fs::read_to_string(path)?;
    let mut products = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let product: Product = serde_json::from_str(line).map_err(|e| {
            taxloop_common::Error::InvalidInput(format!(
                "{}:{}: invalid product: {}",
                path.display(),
                line_no + 1,
                e
            ))
        })?;
        products.push(product);
    }
    Ok(products)
}

/// Auto-accept vs human-review decision for one assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Auto,
    Review,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Auto => "auto",
            Decision::Review => "review",
        }
    }
}

/// Immutable result of one decision-engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryAssignment {
    pub sku: String,
    pub category_slug: String,
    pub top2_slug: Option<String>,
    pub confidence: f64,
    pub top2_confidence: f64,
    /// confidence - top2_confidence
    pub margin: f64,
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub fallback_used: bool,
    pub contradictions: u32,
}

/// Proposal kind. Merge/split/move are structural: they are recorded as
/// synthetic applied changes without a computable patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    RuleTermAdd,
    RuleTermRemove,
    ThresholdTune,
    TaxonomyMerge,
    TaxonomySplit,
    TaxonomyMove,
}

impl ProposalKind {
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ProposalKind::TaxonomyMerge | ProposalKind::TaxonomySplit | ProposalKind::TaxonomyMove
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::RuleTermAdd => "rule_term_add",
            ProposalKind::RuleTermRemove => "rule_term_remove",
            ProposalKind::ThresholdTune => "threshold_tune",
            ProposalKind::TaxonomyMerge => "taxonomy_merge",
            ProposalKind::TaxonomySplit => "taxonomy_split",
            ProposalKind::TaxonomyMove => "taxonomy_move",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rule_term_add" => Some(ProposalKind::RuleTermAdd),
            "rule_term_remove" => Some(ProposalKind::RuleTermRemove),
            "threshold_tune" => Some(ProposalKind::ThresholdTune),
            "taxonomy_merge" => Some(ProposalKind::TaxonomyMerge),
            "taxonomy_split" => Some(ProposalKind::TaxonomySplit),
            "taxonomy_move" => Some(ProposalKind::TaxonomyMove),
            _ => None,
        }
    }
}

/// Proposal lifecycle. Transitions happen only through the apply/rollback
/// manager or an explicit rollback command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Applied,
    Rejected,
    RolledBack,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Proposed => "proposed",
            ProposalStatus::Applied => "applied",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(ProposalStatus::Proposed),
            "applied" => Some(ProposalStatus::Applied),
            "rejected" => Some(ProposalStatus::Rejected),
            "rolled_back" => Some(ProposalStatus::RolledBack),
            _ => None,
        }
    }
}

/// Rule field targeted by a proposal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    IncludeAny,
    IncludeAll,
    ExcludeAny,
    StrongExcludeAny,
    AutoMinConfidence,
    AutoMinMargin,
}

impl RuleField {
    pub fn is_term_set(&self) -> bool {
        matches!(
            self,
            RuleField::IncludeAny
                | RuleField::IncludeAll
                | RuleField::ExcludeAny
                | RuleField::StrongExcludeAny
        )
    }
}

/// Action applied to a rule field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Add,
    Remove,
    Set,
}

/// Typed proposal payload: what to change, where, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalPayload {
    pub target_slug: String,
    pub field: RuleField,
    pub action: RuleAction,
    pub value: serde_json::Value,
    pub reason: String,
}

/// One rule-change or threshold-change proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: Uuid,
    pub store_id: String,
    pub batch_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub kind: ProposalKind,
    pub status: ProposalStatus,
    pub confidence: f64,
    pub expected_impact: f64,
    pub payload: ProposalPayload,
    pub provenance: String,
    pub created_at: DateTime<Utc>,
}

/// Reversible record of one applied taxonomy mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub change_id: Uuid,
    pub proposal_id: Uuid,
    pub store_id: String,
    pub version_before: String,
    pub version_after: String,
    pub status: ChangeStatus,
    pub rollback_token: String,
    pub metadata: serde_json::Value,
    pub applied_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Applied,
    RolledBack,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Applied => "applied",
            ChangeStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(ChangeStatus::Applied),
            "rolled_back" => Some(ChangeStatus::RolledBack),
            _ => None,
        }
    }
}

/// One human QA correction for a classified product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaCorrection {
    pub correction_id: Uuid,
    pub store_id: String,
    pub run_id: Option<Uuid>,
    pub sku: String,
    pub predicted_slug: String,
    pub corrected_slug: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-run quality metrics, persisted as the run's `metrics` JSON column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total: usize,
    pub auto_accepted_rate: f64,
    pub needs_review_rate: f64,
    pub fallback_category_rate: f64,
    /// Accuracy tiers over labeled rows: L1 = exact top-1 match,
    /// L2 = label within top-2, L3 = L2 or the row was routed to review
    pub accuracy_l1: f64,
    pub accuracy_l2: f64,
    pub accuracy_l3: f64,
    pub labeled: usize,
}

/// Frozen, hashed benchmark sample used as the regression baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSnapshot {
    pub snapshot_id: Uuid,
    pub store_id: String,
    pub content_hash: String,
    pub sample: Vec<Product>,
    pub created_at: DateTime<Utc>,
}

/// Immutable harness gate outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessResult {
    pub harness_run_id: Uuid,
    pub store_id: String,
    pub candidate_run_id: Uuid,
    pub baseline_run_id: Uuid,
    pub snapshot_id: Uuid,
    pub passed: bool,
    /// metric name -> (baseline, candidate, delta)
    pub scores: HashMap<String, MetricScore>,
    pub failed_metrics: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricScore {
    pub baseline: f64,
    pub candidate: f64,
    pub delta: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_kind_string_round_trip() {
        for kind in [
            ProposalKind::RuleTermAdd,
            ProposalKind::RuleTermRemove,
            ProposalKind::ThresholdTune,
            ProposalKind::TaxonomyMerge,
            ProposalKind::TaxonomySplit,
            ProposalKind::TaxonomyMove,
        ] {
            assert_eq!(ProposalKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProposalKind::parse("bogus"), None);
    }

    #[test]
    fn jsonl_reader_skips_blanks_and_reports_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.jsonl");
        std::fs::write(
            &path,
            "{\"sku\":\"s1\",\"title\":\"pen\"}\n\n{\"sku\":\"s2\",\"title\":\"notebook\"}\n",
        )
        .unwrap();
        let products = read_products_jsonl(&path).unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[1].sku, "s2");

        std::fs::write(&path, "{\"sku\":\"s1\",\"title\":\"pen\"}\nnot json\n").unwrap();
        let err = read_products_jsonl(&path).unwrap_err();
        assert!(err.to_string().contains(":2:"), "got: {}", err);
    }

    #[test]
    fn structural_kinds() {
        assert!(ProposalKind::TaxonomyMerge.is_structural());
        assert!(ProposalKind::TaxonomySplit.is_structural());
        assert!(ProposalKind::TaxonomyMove.is_structural());
        assert!(!ProposalKind::RuleTermAdd.is_structural());
        assert!(!ProposalKind::ThresholdTune.is_structural());
    }
}
