//! Apply/Rollback manager
//!
//! Applies proposals to the taxonomy store inside one transaction per
//! proposal: taxonomy version insert + head compare-and-set + proposal
//! status flip + AppliedChange insert commit together or not at all.
//! Applies are serialized per store by the head CAS: a stale
//! `version_before` fails with `Conflict` instead of overwriting.

use crate::db;
use crate::models::{
    AppliedChange, ChangeStatus, HarnessResult, Proposal, ProposalStatus, RuleAction, RuleField,
};
use crate::taxonomy::{chain_version, TaxonomyDoc, TaxonomyStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use taxloop_common::{Error, Result};
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one gated apply pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub considered: u32,
    pub applied: u32,
    pub rejected: u32,
    pub skipped_structural: u32,
}

/// Rollback target: one specific change or the latest still-applied one.
#[derive(Debug, Clone, Copy)]
pub enum RollbackTarget {
    Change(Uuid),
    LatestApplied,
}

/// Harness verdict governing an apply pass. `Bootstrap` is the first loop
/// of a store's lifetime, before any harness result exists: applies proceed
/// and the evaluate stage afterwards decides keep-or-rollback.
#[derive(Debug, Clone, Copy)]
pub enum ApplyGate<'a> {
    Bootstrap,
    Latest(&'a HarnessResult),
}

pub struct ApplyManager {
    store: TaxonomyStore,
}

impl ApplyManager {
    pub fn new(store: TaxonomyStore) -> Self {
        Self { store }
    }

    /// Apply every pending proposal for the store, newest harness result
    /// permitting. A failed gate short-circuits the whole pass: zero
    /// considered, zero applied.
    pub async fn apply_learning_proposals(
        &self,
        gate: ApplyGate<'_>,
        max_structural_changes_per_loop: u32,
    ) -> Result<ApplyReport> {
        match gate {
            ApplyGate::Latest(result) if !result.passed => {
                info!(
                    harness_run_id = %result.harness_run_id,
                    failed = ?result.failed_metrics,
                    "Harness gate failed; skipping apply pass entirely"
                );
                return Ok(ApplyReport::default());
            }
            ApplyGate::Latest(_) => {}
            ApplyGate::Bootstrap => {
                info!(store_id = %self.store.store_id(), "No harness history; bootstrap apply pass");
            }
        }

        let pending = db::proposals::list_pending(self.store.pool(), self.store.store_id()).await?;
        let mut report = ApplyReport::default();
        let mut structural_applied = 0u32;

        for proposal in pending {
            if proposal.kind.is_structural() && structural_applied >= max_structural_changes_per_loop
            {
                // Over the cap: leave the proposal `proposed` for a later loop
                report.skipped_structural += 1;
                continue;
            }
            report.considered += 1;

            match self.apply_proposal(&proposal).await {
                Ok(_) => {
                    report.applied += 1;
                    if proposal.kind.is_structural() {
                        structural_applied += 1;
                    }
                }
                Err(Error::InvalidInput(reason)) => {
                    // Validation failure rejects this single proposal only
                    warn!(proposal_id = %proposal.proposal_id, "Rejecting proposal: {}", reason);
                    self.reject(&proposal).await?;
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Apply one proposal transactionally. Returns the reversible change.
    pub async fn apply_proposal(&self, proposal: &Proposal) -> Result<AppliedChange> {
        let (version_before, doc) = self.store.load_current().await?;

        // Structural kinds have no computable patch: record a synthetic
        // change chaining an identical document.
        let new_doc = if proposal.kind.is_structural() {
            doc
        } else {
            patch_doc(doc, proposal)?
        };
        let doc_json = serde_json::to_string(&new_doc)?;

        let proposal_id = proposal.proposal_id.to_string();
        let change_id = Uuid::new_v4();
        let mut tx = self.store.pool().begin().await?;

        let version_after = self
            .store
            .put_version_tx(&mut tx, &version_before, &proposal_id, &doc_json)
            .await?;

        db::proposals::set_status_tx(
            &mut tx,
            proposal.proposal_id,
            ProposalStatus::Proposed,
            ProposalStatus::Applied,
        )
        .await?;

        let change = AppliedChange {
            change_id,
            proposal_id: proposal.proposal_id,
            store_id: self.store.store_id().to_string(),
            version_before: version_before.clone(),
            version_after: version_after.clone(),
            status: ChangeStatus::Applied,
            rollback_token: rollback_token(change_id, &version_before),
            metadata: serde_json::json!({
                "kind": proposal.kind.as_str(),
                "target_slug": proposal.payload.target_slug,
                "synthetic": proposal.kind.is_structural(),
            }),
            applied_at: Utc::now(),
            rolled_back_at: None,
        };
        db::changes::insert_tx(&mut tx, &change).await?;

        tx.commit().await?;
        info!(
            proposal_id = %proposal.proposal_id,
            change_id = %change.change_id,
            version_before = %version_before,
            version_after = %version_after,
            "Applied proposal"
        );
        Ok(change)
    }

    /// Restore the store to the change's `version_before` and flip the
    /// change to rolled_back, recording the reason in the change metadata.
    /// A second rollback of the same change is a `Conflict`, never a
    /// silent success.
    pub async fn rollback(&self, target: RollbackTarget, reason: &str) -> Result<AppliedChange> {
        let change = match target {
            RollbackTarget::Change(change_id) => db::changes::get(self.store.pool(), change_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Applied change not found: {}", change_id)))?,
            RollbackTarget::LatestApplied => {
                db::changes::latest_applied(self.store.pool(), self.store.store_id())
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "No applied change to roll back for store {}",
                            self.store.store_id()
                        ))
                    })?
            }
        };

        if change.status == ChangeStatus::RolledBack {
            return Err(Error::Conflict(format!(
                "Change {} already rolled back",
                change.change_id
            )));
        }

        let mut metadata = change.metadata.clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert(
                "rollback_reason".to_string(),
                serde_json::Value::String(reason.to_string()),
            );
        }

        let mut tx = self.store.pool().begin().await?;
        self.store
            .restore_version_tx(&mut tx, &change.version_after, &change.version_before)
            .await?;
        db::changes::mark_rolled_back_tx(&mut tx, change.change_id, &metadata).await?;
        db::proposals::set_status_tx(
            &mut tx,
            change.proposal_id,
            ProposalStatus::Applied,
            ProposalStatus::RolledBack,
        )
        .await?;
        tx.commit().await?;

        info!(
            change_id = %change.change_id,
            restored_version = %change.version_before,
            reason,
            "Rolled back change"
        );

        db::changes::get(self.store.pool(), change.change_id)
            .await?
            .ok_or_else(|| Error::Internal("Rolled-back change disappeared".into()))
    }

    async fn reject(&self, proposal: &Proposal) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        db::proposals::set_status_tx(
            &mut tx,
            proposal.proposal_id,
            ProposalStatus::Proposed,
            ProposalStatus::Rejected,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn rollback_token(change_id: Uuid, version_before: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(change_id.as_bytes());
    hasher.update(version_before.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute the patched document for a non-structural proposal. Validation
/// failures are `InvalidInput` and reject only this proposal.
fn patch_doc(mut doc: TaxonomyDoc, proposal: &Proposal) -> Result<TaxonomyDoc> {
    let payload = &proposal.payload;

    if doc.category(&payload.target_slug).is_none() {
        return Err(Error::InvalidInput(format!(
            "Unknown category slug: {}",
            payload.target_slug
        )));
    }

    // Ensure a rule row exists for the target
    if doc.rule(&payload.target_slug).is_none() {
        doc.rules.push(crate::taxonomy::CategoryRule {
            slug: payload.target_slug.clone(),
            ..Default::default()
        });
    }
    let rule = doc
        .rule_mut(&payload.target_slug)
        .ok_or_else(|| Error::Internal("Rule vanished during patch".into()))?;

    if payload.field.is_term_set() {
        let terms = match payload.field {
            RuleField::IncludeAny => &mut rule.include_any,
            RuleField::IncludeAll => &mut rule.include_all,
            RuleField::ExcludeAny => &mut rule.exclude_any,
            RuleField::StrongExcludeAny => &mut rule.strong_exclude_any,
            _ => unreachable!("is_term_set covers exactly the term fields"),
        };
        apply_term_action(terms, payload.action, &payload.value)?;
    } else {
        if payload.action != RuleAction::Set {
            return Err(Error::InvalidInput(format!(
                "Only 'set' is legal for threshold field {:?}",
                payload.field
            )));
        }
        let value = payload.value.as_f64().ok_or_else(|| {
            Error::InvalidInput(format!("Threshold value must be numeric: {}", payload.value))
        })?;
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::InvalidInput(format!(
                "Threshold value out of range [0,1]: {}",
                value
            )));
        }
        match payload.field {
            RuleField::AutoMinConfidence => rule.auto_min_confidence = Some(value),
            RuleField::AutoMinMargin => rule.auto_min_margin = Some(value),
            _ => unreachable!("non-term fields are exactly the thresholds"),
        }
    }

    doc.validate()?;
    Ok(doc)
}

/// Term-set mutation with case-insensitive deduplication.
fn apply_term_action(
    terms: &mut Vec<String>,
    action: RuleAction,
    value: &serde_json::Value,
) -> Result<()> {
    match action {
        RuleAction::Add => {
            let term = term_string(value)?;
            let term_lower = term.to_lowercase();
            if !terms.iter().any(|t| t.to_lowercase() == term_lower) {
                terms.push(term);
            }
            Ok(())
        }
        RuleAction::Remove => {
            let term = term_string(value)?;
            let term_lower = term.to_lowercase();
            terms.retain(|t| t.to_lowercase() != term_lower);
            Ok(())
        }
        RuleAction::Set => {
            let values = value.as_array().ok_or_else(|| {
                Error::InvalidInput(format!("Term-set 'set' requires an array: {}", value))
            })?;
            let mut new_terms: Vec<String> = Vec::with_capacity(values.len());
            for v in values {
                let term = term_string(v)?;
                let term_lower = term.to_lowercase();
                if !new_terms.iter().any(|t| t.to_lowercase() == term_lower) {
                    new_terms.push(term);
                }
            }
            *terms = new_terms;
            Ok(())
        }
    }
}

fn term_string(value: &serde_json::Value) -> Result<String> {
    let term = value
        .as_str()
        .ok_or_else(|| Error::InvalidInput(format!("Term value must be a string: {}", value)))?
        .trim();
    if term.is_empty() {
        return Err(Error::InvalidInput("Term value must be non-empty".into()));
    }
    Ok(term.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProposalPayload;
    use crate::taxonomy::{CategoryDef, CategoryRule};

    fn doc() -> TaxonomyDoc {
        TaxonomyDoc {
            categories: vec![
                CategoryDef {
                    slug: "pens".into(),
                    name: "Pens".into(),
                    description: String::new(),
                    synonyms: vec![],
                    attribute_policies: vec![],
                    prototype_embedding: vec![],
                },
                CategoryDef {
                    slug: "other".into(),
                    name: "Other".into(),
                    description: String::new(),
                    synonyms: vec![],
                    attribute_policies: vec![],
                    prototype_embedding: vec![],
                },
            ],
            rules: vec![CategoryRule {
                slug: "pens".into(),
                include_any: vec!["Pen".into()],
                ..Default::default()
            }],
            fallback_slug: "other".into(),
        }
    }

    fn proposal(payload: ProposalPayload) -> Proposal {
        Proposal {
            proposal_id: Uuid::new_v4(),
            store_id: "store-1".into(),
            batch_id: None,
            run_id: None,
            kind: crate::models::ProposalKind::RuleTermAdd,
            status: ProposalStatus::Proposed,
            confidence: 0.5,
            expected_impact: 1.0,
            payload,
            provenance: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn add_is_case_insensitively_deduplicated() {
        let patched = patch_doc(
            doc(),
            &proposal(ProposalPayload {
                target_slug: "pens".into(),
                field: RuleField::IncludeAny,
                action: RuleAction::Add,
                value: serde_json::json!("PEN"),
                reason: String::new(),
            }),
        )
        .unwrap();
        assert_eq!(patched.rule("pens").unwrap().include_any, vec!["Pen"]);
    }

    #[test]
    fn remove_matches_case_insensitively() {
        let patched = patch_doc(
            doc(),
            &proposal(ProposalPayload {
                target_slug: "pens".into(),
                field: RuleField::IncludeAny,
                action: RuleAction::Remove,
                value: serde_json::json!("pen"),
                reason: String::new(),
            }),
        )
        .unwrap();
        assert!(patched.rule("pens").unwrap().include_any.is_empty());
    }

    #[test]
    fn threshold_only_accepts_set() {
        let result = patch_doc(
            doc(),
            &proposal(ProposalPayload {
                target_slug: "pens".into(),
                field: RuleField::AutoMinConfidence,
                action: RuleAction::Add,
                value: serde_json::json!(0.5),
                reason: String::new(),
            }),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn threshold_set_in_range() {
        let patched = patch_doc(
            doc(),
            &proposal(ProposalPayload {
                target_slug: "pens".into(),
                field: RuleField::AutoMinMargin,
                action: RuleAction::Set,
                value: serde_json::json!(0.12),
                reason: String::new(),
            }),
        )
        .unwrap();
        assert_eq!(patched.rule("pens").unwrap().auto_min_margin, Some(0.12));
    }

    #[test]
    fn unknown_slug_is_invalid_input() {
        let result = patch_doc(
            doc(),
            &proposal(ProposalPayload {
                target_slug: "ghost".into(),
                field: RuleField::IncludeAny,
                action: RuleAction::Add,
                value: serde_json::json!("term"),
                reason: String::new(),
            }),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn rollback_token_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(rollback_token(id, "v1"), rollback_token(id, "v1"));
        assert_ne!(rollback_token(id, "v1"), rollback_token(id, "v2"));
    }
}
