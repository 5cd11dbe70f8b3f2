//! Embedding seam and the offline hashing embedder.

use sha2::{Digest, Sha256};

use crate::error::{TriageError, TriageResult};
use crate::text::tokenize;

/// Embedding provider.
///
/// Implementations must return exactly one vector per input, in order.
pub trait Embedder: Send + Sync {
    fn embed_texts(&self, texts: &[String]) -> TriageResult<Vec<Vec<f64>>>;

    /// Identifier recorded alongside cached vectors.
    fn model_id(&self) -> &str;
}

/// Stable 64-bit hash: first 8 bytes of SHA-256, big-endian.
fn stable_hash64(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> TriageResult<f64> {
    if a.len() != b.len() {
        return Err(TriageError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

/// Unit-length copy of `vec`; the zero vector stays zero.
pub fn l2_normalize(vec: &[f64]) -> Vec<f64> {
    let norm_sq: f64 = vec.iter().map(|v| v * v).sum();
    if norm_sq <= 0.0 {
        return vec![0.0; vec.len()];
    }
    let inv = 1.0 / norm_sq.sqrt();
    vec.iter().map(|v| v * inv).collect()
}

/// Cosine similarity in `[-1, 1]`; inputs need not be normalized.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> TriageResult<f64> {
    let aa: f64 = a.iter().map(|v| v * v).sum();
    let bb: f64 = b.iter().map(|v| v * v).sum();
    let ab = dot(a, b)?;
    if aa <= 0.0 || bb <= 0.0 {
        return Ok(0.0);
    }
    Ok(ab / (aa * bb).sqrt())
}

fn char_ngrams(text: &str, n: usize, max_ngrams: usize) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    if cleaned.is_empty() {
        return Vec::new();
    }
    if cleaned.len() <= n {
        return vec![cleaned];
    }
    let mut out = Vec::new();
    for i in 0..=cleaned.len() - n {
        out.push(cleaned[i..i + n].to_string());
        if max_ngrams > 0 && out.len() >= max_ngrams {
            break;
        }
    }
    out
}

/// Deterministic, offline feature-hashing embedder.
///
/// Word tokens and character n-grams are hashed into a fixed-size vector
/// with a sign bit, then L2-normalized. Not a neural model; it only needs to
/// rank near-duplicates above unrelated text.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    pub dim: usize,
    pub token_weight: f64,
    pub ngram_n: usize,
    pub ngram_weight: f64,
    pub max_ngrams: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dim: 512,
            token_weight: 1.0,
            ngram_n: 3,
            ngram_weight: 0.5,
            max_ngrams: 4096,
        }
    }
}

impl HashingEmbedder {
    fn accumulate(&self, vec: &mut [f64], key: &str, weight: f64) {
        let h = stable_hash64(key);
        let idx = (h % self.dim as u64) as usize;
        let sign = if (h >> 63) & 1 == 1 { 1.0 } else { -1.0 };
        vec[idx] += sign * weight;
    }

    fn embed_one(&self, text: &str) -> Vec<f64> {
        let mut vec = vec![0.0; self.dim];
        for token in tokenize(text) {
            self.accumulate(&mut vec, &token, self.token_weight);
        }
        if self.ngram_weight != 0.0 {
            for gram in char_ngrams(text, self.ngram_n, self.max_ngrams) {
                self.accumulate(&mut vec, &format!("g:{gram}"), self.ngram_weight);
            }
        }
        l2_normalize(&vec)
    }
}

impl Embedder for HashingEmbedder {
    fn embed_texts(&self, texts: &[String]) -> TriageResult<Vec<Vec<f64>>> {
        if self.dim == 0 {
            return Err(TriageError::ZeroDimension);
        }
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn model_id(&self) -> &str {
        "hashing-v1"
    }
}
