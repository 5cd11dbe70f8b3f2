//! Mining knobs.
//!
//! The CLI maps flags and `BACKLOG_*` environment variables onto
//! [`MiningConfig`]; library callers build it directly.

use std::env;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use triage_engine::MergeCandidateConfig;

use crate::domain::digest::json_digest;
use crate::domain::error::Result;
use crate::domain::label::DEFAULT_MAX_EVIDENCE_IDS_USED;

pub const ENV_LABELER_MAX_EVIDENCE_ATOMS: &str = "BACKLOG_LABELER_MAX_EVIDENCE_ATOMS";
pub const ENV_LABELER_MAX_EVIDENCE_CHARS: &str = "BACKLOG_LABELER_MAX_EVIDENCE_CHARS";
pub const ENV_LABELER_MAX_EVIDENCE_IDS_USED: &str = "BACKLOG_LABELER_MAX_EVIDENCE_IDS_USED";
pub const ENV_MERGE_JUDGE_MAX_EVIDENCE_ATOMS: &str = "BACKLOG_MERGE_JUDGE_MAX_EVIDENCE_ATOMS";
pub const ENV_MERGE_JUDGE_MAX_EVIDENCE_CHARS: &str = "BACKLOG_MERGE_JUDGE_MAX_EVIDENCE_CHARS";

/// Count and character budget for the evidence slice sent with a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceCaps {
    pub max_atoms: usize,
    pub max_chars: usize,
}

impl Default for EvidenceCaps {
    fn default() -> Self {
        Self {
            max_atoms: 25,
            max_chars: 60_000,
        }
    }
}

impl EvidenceCaps {
    /// Defaults overridden by the given environment variables.
    pub fn from_env(atoms_var: &str, chars_var: &str) -> Self {
        let defaults = Self::default();
        Self {
            max_atoms: env_usize(atoms_var, defaults.max_atoms),
            max_chars: env_usize(chars_var, defaults.max_chars),
        }
    }

    pub fn merge_judge_from_env() -> Self {
        Self::from_env(
            ENV_MERGE_JUDGE_MAX_EVIDENCE_ATOMS,
            ENV_MERGE_JUDGE_MAX_EVIDENCE_CHARS,
        )
    }

    pub fn labeler_from_env() -> Self {
        Self::from_env(ENV_LABELER_MAX_EVIDENCE_ATOMS, ENV_LABELER_MAX_EVIDENCE_CHARS)
    }
}

/// Parse a non-negative integer env var, falling back to `default`.
pub fn env_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<usize>() {
            Ok(value) => value,
            Err(_) => {
                warn!(code = "invalid_env_knob", var = %name, value = %raw, "ignoring non-integer value");
                default
            }
        },
        _ => default,
    }
}

/// Everything that shapes one mining run.
#[derive(Debug, Clone, PartialEq)]
pub struct MiningConfig {
    pub agent: String,
    pub model: Option<String>,
    pub miners: usize,
    /// Atoms per miner job; `0` means every atom.
    pub sample_size: usize,
    pub coverage_miners: usize,
    /// Defaults to `miners - coverage_miners`.
    pub bagging_miners: Option<usize>,
    pub max_tickets_per_miner: usize,
    pub seed: u64,
    pub resume: bool,
    pub force: bool,
    pub dry_run: bool,
    pub merge_enabled: bool,
    pub orphan_passes: usize,
    pub labelers: usize,
    pub max_concurrent: usize,
    /// Accept cached outputs that have no input manifest (miners and
    /// labelers only). Accepted outputs are warned about, get a manifest
    /// backfilled and are reported as `legacy`. On by default.
    pub accept_legacy_cache: bool,
    pub merge_caps: EvidenceCaps,
    pub labeler_caps: EvidenceCaps,
    pub labeler_max_evidence_ids_used: usize,
    pub merge_candidates: MergeCandidateConfig,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            agent: "claude".to_string(),
            model: None,
            miners: 10,
            sample_size: 120,
            coverage_miners: 3,
            bagging_miners: None,
            max_tickets_per_miner: 12,
            seed: 0,
            resume: true,
            force: false,
            dry_run: false,
            merge_enabled: true,
            orphan_passes: 1,
            labelers: 3,
            max_concurrent: 4,
            accept_legacy_cache: true,
            merge_caps: EvidenceCaps::default(),
            labeler_caps: EvidenceCaps::default(),
            labeler_max_evidence_ids_used: DEFAULT_MAX_EVIDENCE_IDS_USED,
            merge_candidates: MergeCandidateConfig::default(),
        }
    }
}

impl MiningConfig {
    /// Apply the `BACKLOG_*` evidence-cap environment overrides.
    pub fn with_env_caps(mut self) -> Self {
        self.merge_caps = EvidenceCaps::merge_judge_from_env();
        self.labeler_caps = EvidenceCaps::labeler_from_env();
        self.labeler_max_evidence_ids_used =
            env_usize(ENV_LABELER_MAX_EVIDENCE_IDS_USED, DEFAULT_MAX_EVIDENCE_IDS_USED);
        self
    }

    /// Digest of the agent-relevant configuration, folded into every
    /// input manifest.
    pub fn cfg_sha256(&self, adapter_identity: &Value) -> Result<String> {
        json_digest(&json!({
            "agent": self.agent,
            "model": self.model,
            "adapter": adapter_identity,
        }))
    }
}
