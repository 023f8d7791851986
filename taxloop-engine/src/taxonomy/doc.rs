//! Taxonomy document types and load-time validation

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use taxloop_common::{Error, Result};

/// Expected attribute values for one category attribute.
///
/// A `locking` policy marks an attribute whose explicit, unambiguous presence
/// on a product deterministically locks the subtype (e.g. format + ruling on
/// paper notebooks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributePolicy {
    pub name: String,
    /// Accepted values, compared case-insensitively
    pub expected: Vec<String>,
    #[serde(default)]
    pub locking: bool,
}

/// Per-category match rule: term sets and optional gate overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryRule {
    pub slug: String,
    #[serde(default)]
    pub include_any: Vec<String>,
    #[serde(default)]
    pub include_all: Vec<String>,
    #[serde(default)]
    pub exclude_any: Vec<String>,
    #[serde(default)]
    pub strong_exclude_any: Vec<String>,
    #[serde(default)]
    pub high_risk: bool,
    #[serde(default)]
    pub auto_min_confidence: Option<f64>,
    #[serde(default)]
    pub auto_min_margin: Option<f64>,
}

/// One category in the schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryDef {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub attribute_policies: Vec<AttributePolicy>,
    /// Prototype embedding for semantic scoring (empty = no prototype yet)
    #[serde(default)]
    pub prototype_embedding: Vec<f32>,
}

/// The whole taxonomy document. Category declaration order is significant:
/// score ties resolve by declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyDoc {
    pub categories: Vec<CategoryDef>,
    pub rules: Vec<CategoryRule>,
    /// Catch-all category for unclassifiable products; never auto-accepted
    pub fallback_slug: String,
}

impl TaxonomyDoc {
    /// Referential integrity, checked once at load time: every rule slug and
    /// the fallback slug must exist in the category schema, and slugs must
    /// be unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for category in &self.categories {
            if !seen.insert(category.slug.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate category slug: {}",
                    category.slug
                )));
            }
        }

        for rule in &self.rules {
            if !seen.contains(rule.slug.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Rule references unknown category slug: {}",
                    rule.slug
                )));
            }
        }

        if !seen.contains(self.fallback_slug.as_str()) {
            return Err(Error::InvalidInput(format!(
                "Fallback slug not in category schema: {}",
                self.fallback_slug
            )));
        }

        Ok(())
    }

    pub fn category(&self, slug: &str) -> Option<&CategoryDef> {
        self.categories.iter().find(|c| c.slug == slug)
    }

    pub fn rule(&self, slug: &str) -> Option<&CategoryRule> {
        self.rules.iter().find(|r| r.slug == slug)
    }

    pub fn rule_mut(&mut self, slug: &str) -> Option<&mut CategoryRule> {
        self.rules.iter_mut().find(|r| r.slug == slug)
    }

    /// Declaration index of a category, used for deterministic tie-breaks.
    pub fn declaration_index(&self, slug: &str) -> usize {
        self.categories
            .iter()
            .position(|c| c.slug == slug)
            .unwrap_or(usize::MAX)
    }
}
