//! Conservative near-duplicate clustering.

use std::collections::BTreeMap;

use tracing::debug;

use crate::embed::Embedder;
use crate::error::TriageResult;
use crate::similarity::{build_item_vectors, compute_pair_similarity, SimilarityWeights, TriageInput};

/// Thresholds for [`dedupe_clusters`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupeThresholds {
    /// Embedding similarity counted as "strong".
    pub embedding: f64,
    /// Overall similarity counted as "strong" (needs a strong embedding too).
    pub overall: f64,
    /// Shared evidence ids that alone make a duplicate.
    pub min_evidence_overlap: usize,
    /// Anchor overlap that supports a strong embedding.
    pub anchor: f64,
    /// Title overlap treated as near-identical.
    pub near_identical_title: f64,
    /// Embedding floor for near-identical titles.
    pub title_embedding_floor: f64,
}

impl Default for DedupeThresholds {
    fn default() -> Self {
        Self {
            embedding: 0.93,
            overall: 0.90,
            min_evidence_overlap: 2,
            anchor: 0.30,
            near_identical_title: 0.95,
            title_embedding_floor: 0.65,
        }
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// The smaller root always wins so roots are stable.
    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        if ra < rb {
            self.parent[rb] = ra;
        } else {
            self.parent[ra] = rb;
        }
    }
}

/// Cluster indices of `items` that describe the same thing.
///
/// Stricter than topical clustering: a pair is merged only on an exact text
/// match, enough shared evidence, a near-identical title backed by the
/// embedding, or a strong embedding backed by anchors or the overall score.
/// Clusters are sorted by their first index; singletons are included.
pub fn dedupe_clusters(
    items: &[TriageInput],
    embedder: &dyn Embedder,
    weights: &SimilarityWeights,
    thresholds: &DedupeThresholds,
) -> TriageResult<Vec<Vec<usize>>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = build_item_vectors(items, embedder)?;
    let mut uf = UnionFind::new(items.len());
    let mut merged_pairs = 0usize;

    for i in 0..vectors.len() {
        for j in i + 1..vectors.len() {
            let sim = compute_pair_similarity(&vectors[i], &vectors[j], weights)?;
            let strong_embedding = sim.embedding_similarity >= thresholds.embedding;
            let duplicate = sim.exact_duplicate
                || sim.evidence_overlap >= thresholds.min_evidence_overlap
                || (sim.title_jaccard >= thresholds.near_identical_title
                    && sim.embedding_similarity >= thresholds.title_embedding_floor)
                || (strong_embedding && sim.anchor_jaccard >= thresholds.anchor)
                || (strong_embedding && sim.overall_similarity >= thresholds.overall);
            if duplicate {
                uf.union(i, j);
                merged_pairs += 1;
            }
        }
    }

    let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for idx in 0..items.len() {
        let root = uf.find(idx);
        by_root.entry(root).or_default().push(idx);
    }
    let mut clusters: Vec<Vec<usize>> = by_root.into_values().collect();
    clusters.sort_by_key(|c| c[0]);

    debug!(
        items = items.len(),
        clusters = clusters.len(),
        merged_pairs,
        "dedupe clustering finished"
    );
    Ok(clusters)
}
