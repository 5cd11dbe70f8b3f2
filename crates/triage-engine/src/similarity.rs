//! Item vectors and the composite pair similarity.

use std::collections::BTreeSet;
use std::env;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::embed::{dot, l2_normalize, Embedder};
use crate::error::{TriageError, TriageResult};
use crate::text::{expand_path_anchors, extract_path_anchors, jaccard, tokenize};

const MAX_TEXT_CHARS: usize = 12_000;
const MAX_CANONICAL_CHARS: usize = 64_000;

/// Caller-side view of one item to compare.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriageInput {
    pub title: String,
    pub chunks: Vec<String>,
    pub evidence_ids: Vec<String>,
}

/// One item as an embedding plus high-precision metadata.
#[derive(Debug, Clone)]
pub struct ItemVector {
    pub title: String,
    pub text: String,
    pub title_tokens: BTreeSet<String>,
    pub anchors: BTreeSet<String>,
    pub evidence_ids: BTreeSet<String>,
    /// SHA-256 of whitespace-collapsed text; empty for empty text.
    pub fingerprint: String,
    pub vector: Vec<f64>,
}

/// Similarity breakdown between two items.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairSimilarity {
    pub embedding_cosine: f64,
    /// Cosine mapped into `[0, 1]`.
    pub embedding_similarity: f64,
    pub anchor_jaccard: f64,
    pub title_jaccard: f64,
    pub evidence_overlap: usize,
    pub exact_duplicate: bool,
    pub overall_similarity: f64,
}

/// Weights for the composite score. Normalized to sum to 1.0 when positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub embedding: f64,
    pub title: f64,
    pub anchor: f64,
    pub evidence: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            embedding: 0.82,
            title: 0.10,
            anchor: 0.06,
            evidence: 0.02,
        }
    }
}

impl SimilarityWeights {
    pub fn normalized(self) -> Self {
        let total = self.embedding + self.title + self.anchor + self.evidence;
        if total <= 0.0 {
            return self;
        }
        Self {
            embedding: self.embedding / total,
            title: self.title / total,
            anchor: self.anchor / total,
            evidence: self.evidence / total,
        }
    }

    /// Defaults overridden from the environment.
    ///
    /// `TRIAGE_ENGINE_SIM_WEIGHTS` takes `embedding,title,anchor,evidence`;
    /// `TRIAGE_ENGINE_SIM_WEIGHT_<FIELD>` overrides single fields and wins.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut weights = Self::default();
        if let Ok(raw) = env::var("TRIAGE_ENGINE_SIM_WEIGHTS") {
            let parts: Vec<f64> = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.parse().ok())
                .collect();
            if let [embedding, title, anchor, evidence] = parts[..] {
                weights = Self {
                    embedding,
                    title,
                    anchor,
                    evidence,
                };
            }
        }
        let field = |name: &str| -> Option<f64> {
            env::var(format!("TRIAGE_ENGINE_SIM_WEIGHT_{name}"))
                .ok()
                .and_then(|v| v.trim().parse().ok())
        };
        if let Some(v) = field("EMBEDDING") {
            weights.embedding = v;
        }
        if let Some(v) = field("TITLE") {
            weights.title = v;
        }
        if let Some(v) = field("ANCHOR") {
            weights.anchor = v;
        }
        if let Some(v) = field("EVIDENCE") {
            weights.evidence = v;
        }
        weights.normalized()
    }
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn canonical_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_CANONICAL_CHARS).collect()
}

/// Join chunks; overlong text keeps head and tail around a snip marker.
fn join_chunks(chunks: &[String], max_chars: usize) -> String {
    let joined = chunks
        .iter()
        .filter(|c| !c.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    let total = joined.chars().count();
    if total <= max_chars {
        return joined;
    }
    let head: String = joined.chars().take(max_chars / 2).collect();
    let tail_len = max_chars - max_chars / 2;
    let tail: String = joined.chars().skip(total - tail_len).collect();
    format!("{head}\n...[snip]...\n{tail}")
}

/// Embed every input and attach title tokens, anchors, evidence and fingerprint.
pub fn build_item_vectors(
    items: &[TriageInput],
    embedder: &dyn Embedder,
) -> TriageResult<Vec<ItemVector>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let mut prepared = Vec::with_capacity(items.len());
    let mut texts = Vec::with_capacity(items.len());
    for item in items {
        let mut chunks: Vec<String> = item
            .chunks
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if !item.title.is_empty() && !chunks.contains(&item.title) {
            chunks.insert(0, item.title.clone());
        }

        let text = join_chunks(&chunks, MAX_TEXT_CHARS);
        let canonical = canonical_text(&text);
        let fingerprint = if canonical.is_empty() {
            String::new()
        } else {
            sha256_hex(&canonical)
        };
        let anchors = expand_path_anchors(&extract_path_anchors(chunks.iter().map(String::as_str)));
        let evidence_ids = item
            .evidence_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();

        texts.push(text.clone());
        prepared.push((item.title.clone(), text, anchors, evidence_ids, fingerprint));
    }

    let raw = embedder.embed_texts(&texts)?;
    if raw.len() != items.len() {
        return Err(TriageError::VectorCount {
            expected: items.len(),
            got: raw.len(),
        });
    }

    Ok(prepared
        .into_iter()
        .zip(raw)
        .map(
            |((title, text, anchors, evidence_ids, fingerprint), vec)| ItemVector {
                title_tokens: tokenize(&title),
                title,
                text,
                anchors,
                evidence_ids,
                fingerprint,
                vector: l2_normalize(&vec),
            },
        )
        .collect())
}

/// Composite similarity of two embedded items.
pub fn compute_pair_similarity(
    left: &ItemVector,
    right: &ItemVector,
    weights: &SimilarityWeights,
) -> TriageResult<PairSimilarity> {
    let exact = !left.fingerprint.is_empty() && left.fingerprint == right.fingerprint;

    // Vectors are unit length, so cosine is the dot product.
    let cos = dot(&left.vector, &right.vector)?.clamp(-1.0, 1.0);
    let emb_sim = (cos + 1.0) / 2.0;

    let anchor_sim = jaccard(&left.anchors, &right.anchors);
    let title_sim = jaccard(&left.title_tokens, &right.title_tokens);
    let evidence_overlap = left.evidence_ids.intersection(&right.evidence_ids).count();
    let evidence_signal = if evidence_overlap == 0 {
        0.0
    } else {
        (evidence_overlap as f64 / 2.0).min(1.0)
    };

    let overall = if exact {
        1.0
    } else {
        (weights.embedding * emb_sim
            + weights.title * title_sim
            + weights.anchor * anchor_sim
            + weights.evidence * evidence_signal)
            .clamp(0.0, 1.0)
    };

    Ok(PairSimilarity {
        embedding_cosine: cos,
        embedding_similarity: emb_sim,
        anchor_jaccard: anchor_sim,
        title_jaccard: title_sim,
        evidence_overlap,
        exact_duplicate: exact,
        overall_similarity: overall,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;

    fn input(title: &str, body: &str, evidence: &[&str]) -> TriageInput {
        TriageInput {
            title: title.to_string(),
            chunks: vec![title.to_string(), body.to_string()],
            evidence_ids: evidence.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn whitespace_only_differences_are_exact() {
        let items = vec![
            input("Fix  runner", "crash on start", &[]),
            input("Fix runner", "crash   on start", &[]),
        ];
        let vectors = build_item_vectors(&items, &HashingEmbedder::default()).unwrap();
        let sim = compute_pair_similarity(&vectors[0], &vectors[1], &SimilarityWeights::default())
            .unwrap();
        assert!(sim.exact_duplicate);
        assert_eq!(sim.title_jaccard, 1.0);
    }

    #[test]
    fn identical_items_are_exact_duplicates() {
        let items = vec![
            input("Fix runner", "crash on start", &["a:1"]),
            input("Fix runner", "crash on start", &["a:2"]),
        ];
        let vectors = build_item_vectors(&items, &HashingEmbedder::default()).unwrap();
        let sim = compute_pair_similarity(&vectors[0], &vectors[1], &SimilarityWeights::default())
            .unwrap();
        assert!(sim.exact_duplicate);
        assert_eq!(sim.overall_similarity, 1.0);
        assert_eq!(sim.evidence_overlap, 0);
    }

    #[test]
    fn evidence_overlap_counts_shared_ids() {
        let items = vec![
            input("One", "alpha", &["a:1", "a:2", "a:3"]),
            input("Two", "beta", &["a:2", "a:3", " "]),
        ];
        let vectors = build_item_vectors(&items, &HashingEmbedder::default()).unwrap();
        let sim = compute_pair_similarity(&vectors[0], &vectors[1], &SimilarityWeights::default())
            .unwrap();
        assert_eq!(sim.evidence_overlap, 2);
        assert!(!sim.exact_duplicate);
        assert!(sim.overall_similarity <= 1.0);
    }

    #[test]
    fn long_text_keeps_head_and_tail() {
        let chunks = vec!["a".repeat(10), "b".repeat(10)];
        let joined = join_chunks(&chunks, 10);
        assert!(joined.starts_with("aaaaa"));
        assert!(joined.ends_with("bbbbb"));
        assert!(joined.contains("[snip]"));
    }

    #[test]
    fn default_weights_sum_to_one() {
        let w = SimilarityWeights::default().normalized();
        let total = w.embedding + w.title + w.anchor + w.evidence;
        assert!((total - 1.0).abs() < 1e-9);
    }

    struct ShortEmbedder;

    impl Embedder for ShortEmbedder {
        fn embed_texts(&self, _texts: &[String]) -> TriageResult<Vec<Vec<f64>>> {
            Ok(vec![vec![1.0]])
        }

        fn model_id(&self) -> &str {
            "short"
        }
    }

    #[test]
    fn vector_count_mismatch_is_an_error() {
        let items = vec![input("a", "b", &[]), input("c", "d", &[])];
        let err = build_item_vectors(&items, &ShortEmbedder).unwrap_err();
        assert!(matches!(err, TriageError::VectorCount { expected: 2, got: 1 }));
    }
}
