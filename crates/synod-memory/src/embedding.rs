//! Vector embeddings and similarity
//!
//! The embedding model is an external collaborator injected through
//! [`EmbeddingProvider`]. [`TokenEmbeddingProvider`] is a deterministic
//! bag-of-words stand-in used by tests and demos.

use crate::error::{SynodError, SynodResult};
use serde::{Deserialize, Serialize};

/// A dense float vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// The vector dimensions
    pub vector: Vec<f32>,

    /// Model used to generate the embedding
    pub model: String,
}

impl Embedding {
    pub fn new(vector: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            vector,
            model: model.into(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// No NaN or infinite components
    pub fn is_finite(&self) -> bool {
        self.vector.iter().all(|x| x.is_finite())
    }

    /// Cosine similarity in [-1, 1]; zero vectors score 0
    pub fn cosine_similarity(&self, other: &Embedding) -> SynodResult<f32> {
        if self.dimensions() != other.dimensions() {
            return Err(SynodError::invalid_input(
                "embedding_dimensions",
                format!("{} vs {}", self.dimensions(), other.dimensions()),
            ));
        }

        let dot_product: f32 = self
            .vector
            .iter()
            .zip(other.vector.iter())
            .map(|(a, b)| a * b)
            .sum();

        let norm_a: f32 = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = other.vector.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return Ok(0.0);
        }

        Ok(dot_product / (norm_a * norm_b))
    }
}

/// Trait for embedding generation backends
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for the given text
    async fn embed(&self, text: &str) -> SynodResult<Embedding>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimensions
    fn dimensions(&self) -> usize;
}

/// Feature-hashed bag-of-words embeddings
///
/// Tokens are lowercased alphanumeric runs with a light suffix folding
/// (`signals` and `signal` share a bucket). Two texts score above zero only
/// when they share tokens, barring bucket collisions.
pub struct TokenEmbeddingProvider {
    dimensions: usize,
}

impl TokenEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a, stable across platforms and toolchains
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % self.dimensions as u64) as usize
    }
}

impl Default for TokenEmbeddingProvider {
    fn default() -> Self {
        Self::new(512)
    }
}

/// Split text into folded tokens
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| fold_suffix(&t.to_lowercase()))
        .collect()
}

fn fold_suffix(token: &str) -> String {
    for suffix in ["ing", "ed"] {
        if token.len() > suffix.len() + 3 {
            if let Some(stem) = token.strip_suffix(suffix) {
                return stem.to_string();
            }
        }
    }
    if token.len() > 3 && !token.ends_with("ss") {
        if let Some(stem) = token.strip_suffix('s') {
            return stem.to_string();
        }
    }
    token.to_string()
}

#[async_trait::async_trait]
impl EmbeddingProvider for TokenEmbeddingProvider {
    async fn embed(&self, text: &str) -> SynodResult<Embedding> {
        let mut vector = vec![0.0; self.dimensions];
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }
        Ok(Embedding::new(vector, self.model_name()))
    }

    fn model_name(&self) -> &str {
        "token-hash"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
