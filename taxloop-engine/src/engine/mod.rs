//! Multi-signal decision engine
//!
//! Assigns one category and decision per product using the current taxonomy
//! version. Per-product classification is pure and order-independent, so the
//! batch path fans out across a bounded worker pool and collects results
//! before any aggregation runs.

pub mod decision;
pub mod scoring;

pub use decision::{
    CandidateScore, REASON_CONTRADICTION, REASON_FALLBACK_RESCUE, REASON_FALLBACK_TOP,
    REASON_HIGH_RISK, REASON_LOW_CONFIDENCE, REASON_LOW_MARGIN, REASON_SUBTYPE_LOCK,
};

use crate::models::{CategoryAssignment, Product};
use crate::services::{Completer, Embedder};
use crate::taxonomy::TaxonomyDoc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use taxloop_common::config::DecisionConfig;
use taxloop_common::Result;
use tracing::{debug, warn};

/// Decision engine over one loaded taxonomy version.
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Classify one product. Absent signals degrade scores to 0; this never
    /// fails for missing data.
    pub fn classify(
        &self,
        product: &Product,
        embedding: Option<&[f32]>,
        doc: &TaxonomyDoc,
    ) -> CategoryAssignment {
        let candidates = decision::score_candidates(product, embedding, doc, &self.config);
        let ranked = decision::rank(candidates);
        let assignment = decision::decide(product, &ranked, doc, &self.config);
        debug!(
            sku = %assignment.sku,
            slug = %assignment.category_slug,
            confidence = assignment.confidence,
            margin = assignment.margin,
            decision = assignment.decision.as_str(),
            "Classified product"
        );
        assignment
    }

    /// Classify a batch: embed all products, enrich attributes through the
    /// completion service, then classify with bounded concurrency. Capability
    /// failures degrade the affected products, never the batch.
    pub async fn classify_batch(
        &self,
        products: Vec<Product>,
        doc: Arc<TaxonomyDoc>,
        embedder: &dyn Embedder,
        completer: &dyn Completer,
        concurrency: usize,
    ) -> Result<Vec<CategoryAssignment>> {
        let texts: Vec<String> = products
            .iter()
            .map(|p| format!("{} {}", p.title, p.description))
            .collect();

        let embeddings = match embedder.embed_many(&texts).await {
            Ok(vectors) if vectors.len() == products.len() => {
                vectors.into_iter().map(Some).collect::<Vec<_>>()
            }
            Ok(vectors) => {
                warn!(
                    requested = products.len(),
                    received = vectors.len(),
                    "Embedding service returned wrong count; degrading to no embeddings"
                );
                vec![None; products.len()]
            }
            Err(e) => {
                warn!("Embedding service failed after retries, degrading: {}", e);
                vec![None; products.len()]
            }
        };

        // Attribute enrichment: missing/malformed per-SKU results become
        // all-null values at zero confidence inside the completer impl.
        let products = match completer.extract_attributes_batch(&doc, &products).await {
            Ok(extractions) => crate::services::merge_extractions(products, &extractions, 0.5),
            Err(e) => {
                warn!("Attribute extraction failed after retries, degrading: {}", e);
                products
            }
        };

        let config = self.config;
        let results: Vec<CategoryAssignment> = stream::iter(
            products
                .into_iter()
                .zip(embeddings.into_iter())
                .map(|(product, embedding)| {
                    let doc = Arc::clone(&doc);
                    async move {
                        let engine = DecisionEngine::new(config);
                        engine.classify(&product, embedding.as_deref(), &doc)
                    }
                }),
        )
        .buffered(concurrency.max(1))
        .collect()
        .await;

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{NullCompleter, NullEmbedder};
    use crate::taxonomy::{CategoryDef, CategoryRule};
    use std::collections::HashMap;

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
                include_any: vec!["pen".into(), "ballpoint".into()],
                ..Default::default()
            }],
            fallback_slug: "other".into(),
        }
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let engine = DecisionEngine::new(DecisionConfig::default());
        let products: Vec<Product> = (0..20)
            .map(|i| Product {
                sku: format!("sku-{}", i),
                title: "ballpoint pen".into(),
                description: String::new(),
                brand: None,
                attributes: HashMap::new(),
                label: None,
            })
            .collect();

        let results = engine
            .classify_batch(
                products,
                Arc::new(doc()),
                &NullEmbedder,
                &NullCompleter,
                4,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 20);
        for (i, assignment) in results.iter().enumerate() {
            assert_eq!(assignment.sku, format!("sku-{}", i));
            assert_eq!(assignment.category_slug, "pens");
        }
    }
}
