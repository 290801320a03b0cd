//! Hashed TF-IDF embedder
//!
//! Feature hashing into a fixed number of buckets. Bucket and sign come from
//! SHA-256 so stored vectors stay comparable across builds and toolchains.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::embedding::Embedder;
use crate::error::Result;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "with", "this", "that", "from", "have", "has",
    "but", "not", "you", "your", "our", "its", "into", "about", "than", "then", "they", "them",
    "is", "of", "to", "in", "on", "at", "it", "be", "as", "by", "or", "an", "we", "my",
];

/// TF-IDF based embedder using hashing trick
pub struct TfIdfEmbedder {
    dimensions: usize,
}

impl TfIdfEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.len() > 1 && !STOPWORDS.contains(s))
            .map(String::from)
            .collect()
    }

    /// Bucket index and sign for a feature
    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut idx_bytes = [0u8; 8];
        idx_bytes.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(idx_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let tokens = Self::tokenize(text);
        let mut embedding = vec![0.0_f32; self.dimensions];
        if tokens.is_empty() {
            return embedding;
        }

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_insert(0.0) += 1.0;
        }

        let doc_len = tokens.len() as f32;
        for (token, count) in tf {
            let tf_score = (1.0 + count / doc_len).ln();
            // longer tokens are rarer
            let idf_score = 1.0 + (token.len() as f32 * 0.1);
            let (idx, sign) = self.bucket(token);
            embedding[idx] += tf_score * idf_score * sign;
        }

        for window in tokens.windows(2) {
            let (idx, sign) = self.bucket(&format!("{}_{}", window[0], window[1]));
            embedding[idx] += 0.25 * sign;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }
}

#[async_trait]
impl Embedder for TfIdfEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "tfidf"
    }
}
