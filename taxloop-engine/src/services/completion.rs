//! Completion service client
//!
//! HTTP client for the external language-model completion service, plus the
//! null implementation used by tests and degraded-mode operation.

use super::{AttributeExtraction, CategoryProfile, Completer, RetryPolicy};
use crate::models::Product;
use crate::taxonomy::TaxonomyDoc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taxloop_common::{Error, Result};
use tracing::warn;

/// Completer backed by an HTTP completion service.
pub struct HttpCompleter {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ProfileRequest<'a> {
    candidate_name: &'a str,
    sample_products: &'a [Product],
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    schema: SchemaSummary,
    products: &'a [Product],
}

#[derive(Serialize)]
struct SchemaSummary {
    categories: Vec<CategorySummary>,
}

#[derive(Serialize)]
struct CategorySummary {
    slug: String,
    attributes: Vec<String>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    results: HashMap<String, AttributeExtraction>,
}

impl HttpCompleter {
    pub fn new(base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            retry,
        }
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Capability(format!("Completion request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Capability(format!(
                "Completion service returned {}",
                response.status()
            )));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| Error::Capability(format!("Completion response malformed: {}", e)))
    }
}

#[async_trait]
impl Completer for HttpCompleter {
    async fn generate_category_profile(
        &self,
        candidate_name: &str,
        sample_products: &[Product],
    ) -> Result<CategoryProfile> {
        let request = ProfileRequest {
            candidate_name,
            sample_products,
        };
        self.retry
            .run("generate_category_profile", || {
                self.post_json("v1/category-profile", &request)
            })
            .await
    }

    async fn extract_attributes_batch(
        &self,
        doc: &TaxonomyDoc,
        products: &[Product],
    ) -> Result<HashMap<String, AttributeExtraction>> {
        let request = ExtractRequest {
            schema: SchemaSummary {
                categories: doc
                    .categories
                    .iter()
                    .map(|c| CategorySummary {
                        slug: c.slug.clone(),
                        attributes: c
                            .attribute_policies
                            .iter()
                            .map(|p| p.name.clone())
                            .collect(),
                    })
                    .collect(),
            },
            products,
        };

        let response: ExtractResponse = self
            .retry
            .run("extract_attributes_batch", || {
                self.post_json("v1/extract-attributes", &request)
            })
            .await?;

        // Contract: one entry per requested SKU. Fill gaps with nulls at
        // zero confidence rather than aborting the batch.
        let mut results = response.results;
        for product in products {
            if !results.contains_key(&product.sku) {
                warn!(sku = %product.sku, "Completion service omitted SKU, degrading to nulls");
                results.insert(product.sku.clone(), AttributeExtraction::null());
            }
        }
        Ok(results)
    }
}

/// Null completer: no profiles, all-null extractions. Used in tests and when
/// no completion service is configured.
pub struct NullCompleter;

#[async_trait]
impl Completer for NullCompleter {
    async fn generate_category_profile(
        &self,
        candidate_name: &str,
        _sample_products: &[Product],
    ) -> Result<CategoryProfile> {
        Ok(CategoryProfile {
            name: candidate_name.to_string(),
            description: String::new(),
            synonyms: vec![],
            attributes: vec![],
        })
    }

    async fn extract_attributes_batch(
        &self,
        _doc: &TaxonomyDoc,
        products: &[Product],
    ) -> Result<HashMap<String, AttributeExtraction>> {
        Ok(products
            .iter()
            .map(|p| (p.sku.clone(), AttributeExtraction::null()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_completer_returns_one_entry_per_sku() {
        let products: Vec<Product> = (0..3)
            .map(|i| Product {
                sku: format!("s{}", i),
                title: "t".into(),
                description: String::new(),
                brand: None,
                attributes: HashMap::new(),
                label: None,
            })
            .collect();
        let doc = TaxonomyDoc {
            categories: vec![],
            rules: vec![],
            fallback_slug: "other".into(),
        };

        let results = NullCompleter
            .extract_attributes_batch(&doc, &products)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|e| e.confidence == 0.0));
    }
}
