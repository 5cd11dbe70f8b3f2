//! Triage-Engine: similarity and trust primitives for backlog tickets
//!
//! Callers map their own records onto [`TriageInput`] (title, free-text
//! chunks, evidence ids) and get back index clusters, ranked candidate
//! pairs, or a bounded trust score. Nothing here performs I/O.
//!
//! ## Layer 1 - Pure Algorithms
//!
//! Focus: deterministic, dependency-light scoring that works offline.
//!
//! ## Key Components
//!
//! - `tokenize` / `extract_path_anchors`: text normalization
//! - `HashingEmbedder`: signed feature-hashing embedder behind the `Embedder` trait
//! - `compute_pair_similarity`: composite similarity breakdown
//! - `dedupe_clusters`: conservative near-duplicate clustering
//! - `build_merge_candidates`: ranked pairs for a merge judge
//! - `assess_trust`: corroboration / diversity / weight scoring

mod candidates;
mod cluster;
mod embed;
mod error;
mod similarity;
mod text;
mod trust;

pub use candidates::{build_merge_candidates, MergeCandidateConfig};
pub use cluster::{dedupe_clusters, DedupeThresholds};
pub use embed::{cosine_similarity, l2_normalize, Embedder, HashingEmbedder};
pub use error::{TriageError, TriageResult};
pub use similarity::{
    build_item_vectors, compute_pair_similarity, ItemVector, PairSimilarity, SimilarityWeights,
    TriageInput,
};
pub use text::{extract_path_anchors, normalized_title, title_jaccard, tokenize};
pub use trust::{
    assess_trust, HeuristicTrustAssessor, TrustAssessment, TrustAssessor, TrustEvidence,
    TrustLevel, TrustSignals,
};
