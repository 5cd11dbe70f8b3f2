//! Error types for triage-engine

use thiserror::Error;

/// Result type for triage operations
pub type TriageResult<T> = std::result::Result<T, TriageError>;

#[derive(Error, Debug)]
pub enum TriageError {
    /// Embedder produced a different number of vectors than inputs
    #[error("embedder returned {got} vectors for {expected} inputs")]
    VectorCount { expected: usize, got: usize },

    /// Vectors of differing dimensions were compared
    #[error("vector dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    /// Embedder configured with a zero dimension
    #[error("embedding dimension must be > 0")]
    ZeroDimension,
}
