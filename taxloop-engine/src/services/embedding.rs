//! Embedding service client

use super::{Embedder, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taxloop_common::{Error, Result};

/// Embedder backed by an HTTP embedding service. The service contract is
/// order-preserving: vector i corresponds to text i.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            retry,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/v1/embed", self.base_url.trim_end_matches('/'));
        let request = EmbedRequest { texts };

        let response: EmbedResponse = self
            .retry
            .run("embed_many", || async {
                let response = self
                    .client
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| Error::Capability(format!("Embedding request failed: {}", e)))?;

                if !response.status().is_success() {
                    return Err(Error::Capability(format!(
                        "Embedding service returned {}",
                        response.status()
                    )));
                }

                response
                    .json::<EmbedResponse>()
                    .await
                    .map_err(|e| Error::Capability(format!("Embedding response malformed: {}", e)))
            })
            .await?;

        if response.vectors.len() != texts.len() {
            return Err(Error::Capability(format!(
                "Embedding service returned {} vectors for {} texts",
                response.vectors.len(),
                texts.len()
            )));
        }

        Ok(response.vectors)
    }
}

/// Null embedder: returns no vectors (empty embeddings), which the engine
/// degrades to a zero semantic score.
pub struct NullEmbedder;

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![Vec::new(); texts.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_embedder_is_order_preserving() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = NullEmbedder.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.is_empty()));
    }
}
