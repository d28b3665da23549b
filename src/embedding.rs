//! Embedding capability

use crate::error::Result;
use async_trait::async_trait;

/// Turns texts into vectors, one per input, same order.
///
/// Implementations are expected to return L2-normalized vectors so that a dot
/// product approximates cosine similarity.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Dot product over the shared prefix of two vectors
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Offline embedding provider based on hashed, lowercased tokens.
///
/// Deterministic and network-free; useful for dry runs and tests, not for
/// semantic quality.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            // FNV-1a over the lowercased token
            let hash = token
                .chars()
                .flat_map(char::to_lowercase)
                .fold(0xcbf29ce484222325u64, |h, c| {
                    (h ^ c as u64).wrapping_mul(0x100000001b3)
                });
            vec[(hash as usize) % self.dimension] += 1.0;
        }

        let norm = dot(&vec, &vec).sqrt();
        if norm > 0.0 {
            vec.iter_mut().for_each(|v| *v /= norm);
        }
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &'static str {
        "hash"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
