//! Built-in lexical embedder and vector similarity
//!
//! [`LexicalEmbedder`] needs no model: it hashes word unigrams and bigrams
//! into a fixed number of buckets. It separates answers that differ in
//! substance while ignoring case, punctuation and word order noise, which
//! is enough for clustering short expert answers. Production deployments
//! can plug a neural embedder in through [`Embedder`].

use std::sync::LazyLock;

use regex::Regex;

use crate::backend::{Embedder, EmbeddingError};

/// Default embedding width
pub const DEFAULT_DIMENSIONS: usize = 512;

static NON_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("NON_WORD_RE regex should compile"));

/// Lower-cased word tokens with punctuation removed
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    NON_WORD_RE
        .replace_all(&lowered, " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Feature-hashed unigram + bigram term-frequency embedder
#[derive(Debug, Clone)]
pub struct LexicalEmbedder {
    dimensions: usize,
}

impl LexicalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn bucket(&self, feature: &str) -> usize {
        let hash = blake3::hash(feature.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.dimensions as u64) as usize
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl Embedder for LexicalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            vector[self.bucket(token)] += 1.0;
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{}_{}", pair[0], pair[1]);
            vector[self.bucket(&bigram)] += 1.0;
        }
        Ok(vector)
    }
}

/// Cosine similarity in `[-1, 1]`; 0 when either vector has no magnitude
/// or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Element-wise mean of equally sized vectors
pub fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut sum = vec![0.0f32; first.len()];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += *x;
        }
    }
    let n = vectors.len() as f32;
    sum.iter_mut().for_each(|x| *x /= n);
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_strips_punctuation_and_case() {
        assert_eq!(
            tokenize("The answer is: 42!  Really."),
            vec!["the", "answer", "is", "42", "really"]
        );
    }

    #[test]
    fn test_identical_text_has_unit_similarity() {
        let embedder = LexicalEmbedder::default();
        let a = embedder.embed("Water boils at 100 degrees Celsius.").unwrap();
        let b = embedder.embed("water boils at 100 degrees celsius").unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_different_answers_are_less_similar() {
        let embedder = LexicalEmbedder::default();
        let a = embedder.embed("The speed of light is constant in vacuum").unwrap();
        let b = embedder.embed("Photosynthesis converts sunlight into sugar").unwrap();
        assert!(cosine_similarity(&a, &b) < 0.3);
    }

    #[test]
    fn test_empty_text_is_an_error() {
        let embedder = LexicalEmbedder::default();
        assert_eq!(embedder.embed(" ... "), Err(EmbeddingError::EmptyInput));
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_centroid_is_mean() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        assert_eq!(centroid(&[&a, &b]), vec![0.5, 0.5]);
        assert!(centroid(&[]).is_empty());
    }
}
