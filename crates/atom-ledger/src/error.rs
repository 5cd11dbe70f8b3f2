//! Error types for atom-ledger

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the ledger persistence layer
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A status string outside the lifecycle enumeration
    #[error("Unsupported atom status: {0:?}")]
    UnsupportedStatus(String),

    /// Document version other than the supported one
    #[error("Unsupported atom ledger version {found} in {path} (expected 1)")]
    UnsupportedVersion { path: PathBuf, found: u32 },

    /// Structurally invalid ledger document
    #[error("Invalid atom ledger {path}: {reason}")]
    InvalidDocument { path: PathBuf, reason: String },

    /// YAML encode/decode failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_status_mentions_value() {
        let err = LedgerError::UnsupportedStatus("done".to_string());
        assert!(err.to_string().contains("\"done\""));
    }

    #[test]
    fn version_error_mentions_path() {
        let err = LedgerError::UnsupportedVersion {
            path: PathBuf::from("configs/backlog_atom_actions.yaml"),
            found: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("backlog_atom_actions.yaml"));
        assert!(msg.contains('7'));
    }
}
