//! Per-category signal scoring
//!
//! Three signals per (product, category) pair, each normalized to [0,1]:
//! lexical term matching, embedding cosine similarity against the category
//! prototype, and attribute compatibility. Missing signals score 0; they
//! never propagate as errors.

use crate::models::Product;
use crate::taxonomy::{AttributePolicy, CategoryDef, CategoryRule};
use std::collections::HashSet;

/// Outcome of lexical scoring for one category.
#[derive(Debug, Clone, Default)]
pub struct LexicalScore {
    /// Normalized score in [0,1]
    pub score: f64,
    /// include_any/include_all terms that matched
    pub matched_terms: Vec<String>,
    /// strong_exclude_any matches; any hit disqualifies auto-acceptance
    pub contradictions: u32,
}

/// Lowercase word tokens of a text block.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// True when `term` (possibly multi-word) occurs in the token stream.
fn term_matches(term: &str, tokens: &HashSet<String>, raw_lower: &str) -> bool {
    let term_lower = term.to_lowercase();
    if term_lower.contains(' ') {
        raw_lower.contains(&term_lower)
    } else {
        tokens.contains(&term_lower)
    }
}

/// Lexical score for one rule.
///
/// include_any hits count once, twice when matched in the title. A fully
/// matched include_all set counts as one weighted hit per term; a partially
/// matched set contributes nothing. exclude_any hits subtract softly;
/// strong_exclude_any hits subtract hard and record a contradiction.
/// `saturation` is the hit count at which the score reaches 1.0.
pub fn lexical_score(product: &Product, rule: &CategoryRule, saturation: f64) -> LexicalScore {
    let title_lower = product.title.to_lowercase();
    let body_lower = format!(
        "{} {} {}",
        product.title,
        product.description,
        product.brand.as_deref().unwrap_or("")
    )
    .to_lowercase();

    let title_tokens: HashSet<String> = tokenize(&product.title).into_iter().collect();
    let body_tokens: HashSet<String> = tokenize(&body_lower).into_iter().collect();

    let mut hits = 0.0_f64;
    let mut matched_terms = Vec::new();
    let mut contradictions = 0u32;

    for term in &rule.include_any {
        if term_matches(term, &body_tokens, &body_lower) {
            // Title matches are double-weighted
            if term_matches(term, &title_tokens, &title_lower) {
                hits += 2.0;
            } else {
                hits += 1.0;
            }
            matched_terms.push(term.clone());
        }
    }

    if !rule.include_all.is_empty() {
        let all_matched = rule
            .include_all
            .iter()
            .all(|term| term_matches(term, &body_tokens, &body_lower));
        if all_matched {
            for term in &rule.include_all {
                if term_matches(term, &title_tokens, &title_lower) {
                    hits += 2.0;
                } else {
                    hits += 1.0;
                }
                matched_terms.push(term.clone());
            }
        }
    }

    for term in &rule.exclude_any {
        if term_matches(term, &body_tokens, &body_lower) {
            hits -= 1.0;
        }
    }

    for term in &rule.strong_exclude_any {
        if term_matches(term, &body_tokens, &body_lower) {
            hits -= saturation;
            contradictions += 1;
        }
    }

    let score = (hits / saturation.max(1.0)).clamp(0.0, 1.0);
    LexicalScore {
        score,
        matched_terms,
        contradictions,
    }
}

/// Cosine similarity clamped to [0,1]. Empty or mismatched vectors score 0.
pub fn semantic_score(embedding: Option<&[f32]>, prototype: &[f32]) -> f64 {
    let Some(embedding) = embedding else {
        return 0.0;
    };
    if embedding.is_empty() || prototype.is_empty() || embedding.len() != prototype.len() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (a, b) in embedding.iter().zip(prototype.iter()) {
        dot += (*a as f64) * (*b as f64);
        norm_a += (*a as f64) * (*a as f64);
        norm_b += (*b as f64) * (*b as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Fraction of the category's attribute policies satisfied by the product's
/// extracted attributes. No policies or no attributes scores 0.
pub fn attribute_score(product: &Product, category: &CategoryDef) -> f64 {
    if category.attribute_policies.is_empty() || product.attributes.is_empty() {
        return 0.0;
    }

    let satisfied = category
        .attribute_policies
        .iter()
        .filter(|policy| policy_satisfied(product, policy))
        .count();

    satisfied as f64 / category.attribute_policies.len() as f64
}

pub(crate) fn policy_satisfied(product: &Product, policy: &AttributePolicy) -> bool {
    product
        .attributes
        .get(&policy.name)
        .map(|value| {
            let value_lower = value.to_lowercase();
            policy
                .expected
                .iter()
                .any(|expected| expected.to_lowercase() == value_lower)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn product(title: &str, description: &str) -> Product {
        Product {
            sku: "sku-1".into(),
            title: title.into(),
            description: description.into(),
            brand: None,
            attributes: HashMap::new(),
            label: None,
        }
    }

    fn rule(include_any: &[&str], strong_exclude: &[&str]) -> CategoryRule {
        CategoryRule {
            slug: "c".into(),
            include_any: include_any.iter().map(|s| s.to_string()).collect(),
            strong_exclude_any: strong_exclude.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn title_match_is_double_weighted() {
        let r = rule(&["notebook"], &[]);
        let in_title = lexical_score(&product("A5 notebook", ""), &r, 4.0);
        let in_body = lexical_score(&product("A5 journal", "a notebook"), &r, 4.0);
        assert!(in_title.score > in_body.score);
    }

    #[test]
    fn strong_exclude_records_contradiction() {
        let r = rule(&["notebook"], &["laptop"]);
        let s = lexical_score(&product("notebook laptop", ""), &r, 4.0);
        assert_eq!(s.contradictions, 1);
        assert_eq!(s.score, 0.0);
    }

    #[test]
    fn multi_word_terms_match_phrases() {
        let r = rule(&["spiral bound"], &[]);
        let s = lexical_score(&product("spiral bound notebook", ""), &r, 4.0);
        assert_eq!(s.matched_terms, vec!["spiral bound".to_string()]);
    }

    #[test]
    fn missing_embedding_scores_zero() {
        assert_eq!(semantic_score(None, &[1.0, 0.0]), 0.0);
        assert_eq!(semantic_score(Some(&[1.0]), &[]), 0.0);
        assert_eq!(semantic_score(Some(&[1.0]), &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn identical_vectors_score_one() {
        let v = [0.6_f32, 0.8];
        let s = semantic_score(Some(&v), &v);
        assert!((s - 1.0).abs() < 1e-9);
    }
}
