//! Injected capability services
//!
//! Two narrow seams: `Completer` (LLM text completion) and `Embedder`
//! (vector embeddings). HTTP implementations talk to external services under
//! the shared retry policy; null implementations serve tests and degraded
//! mode. Correctness of the services themselves is assumed at this boundary:
//! the contract enforced here is shape, ordering, and per-SKU degradation.

mod completion;
mod embedding;
mod retry;

pub use completion::{HttpCompleter, NullCompleter};
pub use embedding::{HttpEmbedder, NullEmbedder};
pub use retry::RetryPolicy;

use crate::models::Product;
use crate::taxonomy::TaxonomyDoc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taxloop_common::Result;

/// Generated category profile for a merge/split candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryProfile {
    pub name: String,
    pub description: String,
    pub synonyms: Vec<String>,
    pub attributes: Vec<String>,
}

/// Attribute values extracted for one SKU. A missing or malformed service
/// result for a SKU is represented as all-null values at zero confidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeExtraction {
    pub values: HashMap<String, Option<String>>,
    pub confidence: f64,
}

impl AttributeExtraction {
    /// Degraded placeholder for a SKU the service failed on.
    pub fn null() -> Self {
        Self::default()
    }
}

/// Language-model completion capability.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn generate_category_profile(
        &self,
        candidate_name: &str,
        sample_products: &[Product],
    ) -> Result<CategoryProfile>;

    /// One entry per requested SKU, always. Implementations fill missing or
    /// malformed service results with `AttributeExtraction::null()` instead
    /// of erroring the batch.
    async fn extract_attributes_batch(
        &self,
        doc: &TaxonomyDoc,
        products: &[Product],
    ) -> Result<HashMap<String, AttributeExtraction>>;
}

/// Vector embedding capability. Output is order-preserving with respect to
/// the input texts and has fixed dimensionality.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Merge extracted attribute values into products. Only extractions at or
/// above `min_confidence` contribute; null values never overwrite existing
/// explicit attributes.
pub fn merge_extractions(
    mut products: Vec<Product>,
    extractions: &HashMap<String, AttributeExtraction>,
    min_confidence: f64,
) -> Vec<Product> {
    for product in &mut products {
        let Some(extraction) = extractions.get(&product.sku) else {
            continue;
        };
        if extraction.confidence < min_confidence {
            continue;
        }
        for (name, value) in &extraction.values {
            if let Some(value) = value {
                product
                    .attributes
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
    products
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_respects_confidence_floor_and_existing_values() {
        let mut product = Product {
            sku: "s1".into(),
            title: "t".into(),
            description: String::new(),
            brand: None,
            attributes: HashMap::from([("format".to_string(), "a4".to_string())]),
            label: None,
        };
        product.attributes.insert("format".into(), "a4".into());

        let mut extractions = HashMap::new();
        extractions.insert(
            "s1".to_string(),
            AttributeExtraction {
                values: HashMap::from([
                    ("format".to_string(), Some("a5".to_string())),
                    ("ruling".to_string(), Some("dotted".to_string())),
                    ("color".to_string(), None),
                ]),
                confidence: 0.9,
            },
        );

        let merged = merge_extractions(vec![product], &extractions, 0.5);
        let attrs = &merged[0].attributes;
        // Existing explicit value wins
        assert_eq!(attrs.get("format").unwrap(), "a4");
        assert_eq!(attrs.get("ruling").unwrap(), "dotted");
        assert!(!attrs.contains_key("color"));
    }

    #[test]
    fn merge_skips_low_confidence() {
        let product = Product {
            sku: "s1".into(),
            title: "t".into(),
            description: String::new(),
            brand: None,
            attributes: HashMap::new(),
            label: None,
        };
        let extractions = HashMap::from([(
            "s1".to_string(),
            AttributeExtraction {
                values: HashMap::from([("ruling".to_string(), Some("lined".to_string()))]),
                confidence: 0.1,
            },
        )]);

        let merged = merge_extractions(vec![product], &extractions, 0.5);
        assert!(merged[0].attributes.is_empty());
    }
}
