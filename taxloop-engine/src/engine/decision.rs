//! Category ranking and the auto/review decision rule

use super::scoring::{self, LexicalScore};
use crate::models::{CategoryAssignment, Decision, Product};
use crate::taxonomy::TaxonomyDoc;
use taxloop_common::config::DecisionConfig;

/// Reason tags attached to assignments.
pub const REASON_FALLBACK_RESCUE: &str = "fallback_rescue_applied";
pub const REASON_SUBTYPE_LOCK: &str = "subtype_lock";
pub const REASON_CONTRADICTION: &str = "contradiction_blocked_auto";
pub const REASON_HIGH_RISK: &str = "high_risk_extra_confidence";
pub const REASON_LOW_CONFIDENCE: &str = "below_confidence_gate";
pub const REASON_LOW_MARGIN: &str = "below_margin_gate";
pub const REASON_FALLBACK_TOP: &str = "fallback_category_top";

/// Scored candidate for one (product, category) pair.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub slug: String,
    pub confidence: f64,
    pub lexical: LexicalScore,
    pub semantic: f64,
    pub attribute: f64,
    /// Category declaration index, the deterministic tie-break key
    pub declaration_index: usize,
    /// All locking attribute policies satisfied by explicit product evidence
    pub subtype_locked: bool,
}

/// Score every category for one product. Missing signals (no embedding, no
/// rule, no prototype) degrade to 0 component scores.
pub fn score_candidates(
    product: &Product,
    embedding: Option<&[f32]>,
    doc: &TaxonomyDoc,
    config: &DecisionConfig,
) -> Vec<CandidateScore> {
    let weight_sum = config.lexical_weight + config.semantic_weight + config.attribute_weight;

    doc.categories
        .iter()
        .enumerate()
        .map(|(index, category)| {
            let lexical = doc
                .rule(&category.slug)
                .map(|rule| scoring::lexical_score(product, rule, config.lexical_saturation))
                .unwrap_or_default();
            let semantic = scoring::semantic_score(embedding, &category.prototype_embedding);
            let attribute = scoring::attribute_score(product, category);

            let confidence = ((config.lexical_weight * lexical.score
                + config.semantic_weight * semantic
                + config.attribute_weight * attribute)
                / weight_sum)
                .clamp(0.0, 1.0);

            let locking_policies: Vec<_> = category
                .attribute_policies
                .iter()
                .filter(|p| p.locking)
                .collect();
            let subtype_locked = !locking_policies.is_empty()
                && locking_policies
                    .iter()
                    .all(|policy| scoring::policy_satisfied(product, policy));

            CandidateScore {
                slug: category.slug.clone(),
                confidence,
                lexical,
                semantic,
                attribute,
                declaration_index: index,
                subtype_locked,
            }
        })
        .collect()
}

/// Rank candidates by confidence descending. Equal scores resolve by
/// declaration order: the sort is stable and the input is already in
/// declaration order.
pub fn rank(mut candidates: Vec<CandidateScore>) -> Vec<CandidateScore> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Apply the decision rule to ranked candidates and produce the assignment.
pub fn decide(
    product: &Product,
    ranked: &[CandidateScore],
    doc: &TaxonomyDoc,
    config: &DecisionConfig,
) -> CategoryAssignment {
    // An empty taxonomy yields a fallback review assignment rather than a panic.
    let Some(top) = ranked.first() else {
        return CategoryAssignment {
            sku: product.sku.clone(),
            category_slug: doc.fallback_slug.clone(),
            top2_slug: None,
            confidence: 0.0,
            top2_confidence: 0.0,
            margin: 0.0,
            decision: Decision::Review,
            reasons: vec![REASON_FALLBACK_TOP.to_string()],
            fallback_used: true,
            contradictions: 0,
        };
    };

    let top2 = ranked.get(1);
    let mut reasons = Vec::new();
    let mut chosen = top.clone();
    let mut rescued = false;

    // Fallback rescue: the generic catch-all won but a secondary signal
    // strongly implicates one specific family. Reassign, but the rescue
    // itself can never reach auto.
    if chosen.slug == doc.fallback_slug {
        if let Some(rescue) = rescue_target(ranked, doc) {
            chosen = rescue.clone();
            rescued = true;
            reasons.push(REASON_FALLBACK_RESCUE.to_string());
        }
    }

    let top2_confidence = top2.map(|c| c.confidence).unwrap_or(0.0);
    let margin = (chosen.confidence - top2_confidence).max(0.0);

    let rule = doc.rule(&chosen.slug);
    let min_confidence = rule
        .and_then(|r| r.auto_min_confidence)
        .unwrap_or(config.auto_min_confidence);
    let min_margin = rule
        .and_then(|r| r.auto_min_margin)
        .unwrap_or(config.auto_min_margin);
    let high_risk = rule.map(|r| r.high_risk).unwrap_or(false);

    let required_confidence = if high_risk {
        reasons.push(REASON_HIGH_RISK.to_string());
        min_confidence + config.high_risk_confidence_penalty
    } else {
        min_confidence
    };

    let is_fallback = chosen.slug == doc.fallback_slug;
    let contradictions = chosen.lexical.contradictions;

    let mut auto = true;
    if chosen.confidence < required_confidence {
        reasons.push(REASON_LOW_CONFIDENCE.to_string());
        auto = false;
    }
    if margin < min_margin {
        if chosen.subtype_locked {
            // Explicit unambiguous attribute evidence locks the subtype and
            // carries the decision past the margin boundary.
            reasons.push(REASON_SUBTYPE_LOCK.to_string());
        } else {
            reasons.push(REASON_LOW_MARGIN.to_string());
            auto = false;
        }
    } else if chosen.subtype_locked {
        reasons.push(REASON_SUBTYPE_LOCK.to_string());
    }
    if contradictions > 0 {
        reasons.push(REASON_CONTRADICTION.to_string());
        auto = false;
    }
    if is_fallback {
        reasons.push(REASON_FALLBACK_TOP.to_string());
        auto = false;
    }
    // Rescued assignments are permanently review-only, even when every
    // other gate would pass.
    if rescued {
        auto = false;
    }

    CategoryAssignment {
        sku: product.sku.clone(),
        category_slug: chosen.slug.clone(),
        top2_slug: top2.map(|c| c.slug.clone()),
        confidence: chosen.confidence,
        top2_confidence,
        margin,
        decision: if auto { Decision::Auto } else { Decision::Review },
        reasons,
        fallback_used: is_fallback,
        contradictions,
    }
}

/// Find a rescue target among non-fallback candidates: either a clearly
/// separated semantic cluster or explicit attribute evidence for exactly one
/// family.
fn rescue_target<'a>(
    ranked: &'a [CandidateScore],
    doc: &TaxonomyDoc,
) -> Option<&'a CandidateScore> {
    const SEMANTIC_RESCUE_FLOOR: f64 = 0.55;

    let non_fallback: Vec<&CandidateScore> = ranked
        .iter()
        .filter(|c| c.slug != doc.fallback_slug)
        .collect();

    // Explicit attribute evidence pointing at exactly one family
    let attribute_hits: Vec<&&CandidateScore> =
        non_fallback.iter().filter(|c| c.attribute > 0.0).collect();
    if attribute_hits.len() == 1 {
        return Some(attribute_hits[0]);
    }

    // Distinct embedding cluster: one candidate clearly above the floor and
    // clearly above every other non-fallback candidate
    let mut by_semantic = non_fallback.clone();
    by_semantic.sort_by(|a, b| {
        b.semantic
            .partial_cmp(&a.semantic)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(best) = by_semantic.first() {
        let runner_up = by_semantic.get(1).map(|c| c.semantic).unwrap_or(0.0);
        if best.semantic >= SEMANTIC_RESCUE_FLOOR && best.semantic - runner_up >= 0.15 {
            return Some(best);
        }
    }

    None
}
