//! Ranked candidate pairs for the merge judge.

use crate::embed::Embedder;
use crate::error::TriageResult;
use crate::similarity::{build_item_vectors, compute_pair_similarity, SimilarityWeights, TriageInput};

/// Bounds for [`build_merge_candidates`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeCandidateConfig {
    pub max_candidates: usize,
    /// Overall similarity that keeps a pair on its own.
    pub overall_threshold: f64,
    /// Keep pairs that share any path anchor.
    pub keep_anchor_pairs: bool,
}

impl Default for MergeCandidateConfig {
    fn default() -> Self {
        Self {
            max_candidates: 200,
            overall_threshold: 0.55,
            keep_anchor_pairs: true,
        }
    }
}

/// Index pairs `(i, j)` with `i < j` likely describing the same issue,
/// ordered by decreasing score then index.
pub fn build_merge_candidates(
    items: &[TriageInput],
    embedder: &dyn Embedder,
    weights: &SimilarityWeights,
    config: &MergeCandidateConfig,
) -> TriageResult<Vec<(usize, usize)>> {
    if items.len() < 2 {
        return Ok(Vec::new());
    }
    let vectors = build_item_vectors(items, embedder)?;

    let mut scored: Vec<(f64, usize, usize)> = Vec::new();
    for i in 0..vectors.len() {
        for j in i + 1..vectors.len() {
            let sim = compute_pair_similarity(&vectors[i], &vectors[j], weights)?;
            let keep = sim.exact_duplicate
                || sim.evidence_overlap > 0
                || (config.keep_anchor_pairs && sim.anchor_jaccard > 0.0)
                || sim.title_jaccard >= 0.5
                || sim.overall_similarity >= config.overall_threshold;
            if !keep {
                continue;
            }
            let score = sim.overall_similarity
                + 0.03 * sim.evidence_overlap.min(3) as f64
                + 0.02 * sim.anchor_jaccard
                + 0.02 * sim.title_jaccard;
            scored.push((score, i, j));
        }
    }

    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    Ok(scored
        .into_iter()
        .take(config.max_candidates)
        .map(|(_, i, j)| (i, j))
        .collect())
}
