//! Domain-level error taxonomy for the backlog miner.
//!
//! Only [`BacklogError::Configuration`] aborts a mining run. Every other
//! variant is caught at the unit boundary (one miner job, one merge pair,
//! one labeler variant) and recorded as a unit status instead.

use std::path::PathBuf;

/// Backlog miner errors.
#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    /// Missing or invalid prompt manifest, template, atoms file or knob.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unreadable or structurally invalid cached artifact.
    #[error("cache corruption at {path}: {reason}")]
    CacheCorruption { path: PathBuf, reason: String },

    /// The agent adapter failed or returned nothing usable.
    #[error("agent invocation failed: {0}")]
    AgentInvocation(String),

    /// Agent output could not be decoded into the expected shape.
    #[error("output parse failed: {0}")]
    OutputParse(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] atom_ledger::LedgerError),

    #[error("cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),
}

impl BacklogError {
    pub fn config(msg: impl Into<String>) -> Self {
        BacklogError::Configuration(msg.into())
    }

    /// True for errors that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BacklogError::Configuration(_))
    }
}

/// Result type for backlog miner operations.
pub type Result<T> = std::result::Result<T, BacklogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_is_fatal() {
        let err = BacklogError::config("missing manifest.json");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("manifest.json"));
    }

    #[test]
    fn unit_errors_are_not_fatal() {
        assert!(!BacklogError::AgentInvocation("exit 1".into()).is_fatal());
        assert!(!BacklogError::OutputParse("no array".into()).is_fatal());
        let err = BacklogError::CacheCorruption {
            path: PathBuf::from("miners/miner_001/tickets.json"),
            reason: "expected a list".into(),
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("miner_001"));
    }
}
