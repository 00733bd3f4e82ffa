//! The `Embedder.embed(text) -> vector<float>` external collaborator.
//!
//! Grounded in the teacher's `knowledge/embeddings.rs::EmbeddingProvider` /
//! `OpenAIEmbeddings`.

use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
}

/// OpenAI `text-embedding-*` HTTP client.
pub struct OpenAiEmbeddings {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String, model: String, dimension: usize) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_key,
            model,
            dimension,
        }
    }

    pub fn new_default(api_key: String) -> Self {
        Self::new(api_key, "text-embedding-3-small".to_string(), 1536)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut results = self.embed_batch(vec![text]).await?;
        results
            .pop()
            .context("embedding response contained no vectors")
    }

    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .http_client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("embedding request failed")?
            .error_for_status()
            .context("embedding endpoint returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("parsing embedding response")?;

        let data = resp["data"]
            .as_array()
            .context("unexpected embedding response shape")?;

        data.iter()
            .map(|entry| {
                entry["embedding"]
                    .as_array()
                    .context("embedding entry missing vector")?
                    .iter()
                    .map(|v| v.as_f64().map(|f| f as f32).context("non-numeric embedding component"))
                    .collect::<Result<Vec<f32>>>()
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic content-hash-based fake embedder for tests: never calls
/// out to a network, produces a stable unit vector from the text's bytes.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            vec[i % self.dimension] += f32::from(byte);
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        Ok(vec)
    }

    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Cosine similarity between two equal-length vectors, clamped to `[0, 1]`
/// per spec.md §3's `similarity_to_parent` invariant (negative cosine is
/// clamped up to 0, not left negative).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let e = HashEmbedder::new(16);
        let a = e.embed("hello world").await.unwrap();
        let b = e.embed("hello world").await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_clamped_to_zero_one() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
