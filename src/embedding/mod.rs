//! Embedding generation
//!
//! Supports two backends:
//! - Hashed TF-IDF (deterministic, no network); the default
//! - OpenAI-compatible `/embeddings` endpoint - requires `openai` feature
//!
//! Embeddings are computed once on write and stored next to the memory, so
//! the backend (and its dimensions) must stay fixed for the lifetime of a
//! database.

#[cfg(feature = "openai")]
mod openai;
mod tfidf;

#[cfg(feature = "openai")]
pub use openai::OpenAIEmbedder;
pub use tfidf::TfIdfEmbedder;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Result, StewardError};
use crate::types::EmbeddingConfig;

/// Trait for embedding generators
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch)
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Get embedding dimensions
    fn dimensions(&self) -> usize;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Create an embedder from configuration
///
/// - `"tfidf"`: always available
/// - `"openai"`: requires the `openai` feature and an API key; `base_url`
///   and `embedding_model` select any OpenAI-compatible provider
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    if config.dimensions == 0 {
        return Err(StewardError::Config(
            "embedding dimensions must be positive".to_string(),
        ));
    }

    match config.model.as_str() {
        #[cfg(feature = "openai")]
        "openai" => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                StewardError::Config(
                    "OPENAI_API_KEY required when STEWARD_EMBEDDING_MODEL=openai".to_string(),
                )
            })?;
            Ok(Arc::new(OpenAIEmbedder::with_config(
                api_key,
                config.base_url.clone(),
                config.embedding_model.clone(),
                config.dimensions,
            )))
        }
        #[cfg(not(feature = "openai"))]
        "openai" => Err(StewardError::Config(
            "OpenAI embeddings require the 'openai' feature".to_string(),
        )),
        "tfidf" => Ok(Arc::new(TfIdfEmbedder::new(config.dimensions))),
        other => Err(StewardError::Config(format!(
            "Unknown embedding model: '{}'. Use 'openai' or 'tfidf'",
            other
        ))),
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &[1.0, 0.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.001);
        assert!((cosine_similarity(&a, &[-1.0, 0.0, 0.0]) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_create_embedder() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.dimensions(), 384);
        assert_eq!(embedder.model_name(), "tfidf");

        let unknown = EmbeddingConfig {
            model: "word2vec".to_string(),
            ..Default::default()
        };
        assert!(create_embedder(&unknown).is_err());
    }
}
