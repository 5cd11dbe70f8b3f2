//! Storage trait definitions for the atom lifecycle ledger
//!
//! - `LedgerEntry`: one atom's persisted lifecycle record
//! - `AtomLedger`: async, backend-agnostic load / update
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::status::AtomStatus;

/// Result type for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Ledger contents keyed by atom id (sorted, so iteration is deterministic).
pub type LedgerSnapshot = BTreeMap<String, LedgerEntry>;

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// Persisted lifecycle record for one atom.
///
/// Fields the miner does not know about are kept in `extra` and written
/// back untouched, so other tools can annotate the same file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub atom_id: String,
    #[serde(default)]
    pub status: AtomStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Status the most recent backlog run asked for (before promotion).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backlog_status: Option<AtomStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backlog_generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backlog_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_rel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_input: Option<String>,
    #[serde(default)]
    pub ticket_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl LedgerEntry {
    /// Fresh entry with status `new`.
    pub fn new(atom_id: impl Into<String>) -> Self {
        Self {
            atom_id: atom_id.into(),
            status: AtomStatus::New,
            first_seen_at: None,
            last_seen_at: None,
            last_backlog_status: None,
            last_backlog_generated_at: None,
            last_backlog_json: None,
            source: None,
            severity_hint: None,
            run_rel: None,
            agent: None,
            mission_id: None,
            persona_id: None,
            target_slug: None,
            repo_input: None,
            ticket_ids: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Move the status forward; lower statuses are ignored.
    ///
    /// Returns `true` when the status actually advanced.
    pub fn promote(&mut self, desired: AtomStatus) -> bool {
        let next = self.status.promote(desired);
        let advanced = next > self.status;
        self.status = next;
        advanced
    }

    /// Sort and dedupe list fields so serialized output is stable.
    pub fn normalize(&mut self) {
        self.ticket_ids.retain(|id| !id.trim().is_empty());
        self.ticket_ids.sort();
        self.ticket_ids.dedup();
    }
}

// ---------------------------------------------------------------------------
// AtomLedger
// ---------------------------------------------------------------------------

/// Atom lifecycle ledger.
///
/// Guarantees:
/// - `load()` on a ledger that was never written returns an empty snapshot.
/// - `update(f)` loads, applies `f`, and persists as one atomic step; a
///   failure inside `f` leaves the stored ledger untouched.
/// - Statuses are never lowered by `promote`.
#[async_trait]
pub trait AtomLedger: Send + Sync {
    /// Read the full ledger.
    async fn load(&self) -> LedgerResult<LedgerSnapshot>;

    /// Atomic read-modify-write of the full ledger.
    async fn update(
        &self,
        mutate: &mut (dyn for<'s> FnMut(&'s mut LedgerSnapshot) -> LedgerResult<()> + Send),
    ) -> LedgerResult<()>;

    /// Current status of one atom (`new` when absent).
    async fn status_of(&self, atom_id: &str) -> LedgerResult<AtomStatus> {
        let snapshot = self.load().await?;
        Ok(snapshot
            .get(atom_id)
            .map(|entry| entry.status)
            .unwrap_or_default())
    }

    /// Promote one atom, creating its entry when missing.
    ///
    /// Returns the resulting status, which is never lower than before.
    async fn promote(&self, atom_id: &str, desired: AtomStatus) -> LedgerResult<AtomStatus> {
        let mut result = AtomStatus::New;
        self.update(&mut |snapshot: &mut LedgerSnapshot| {
            let entry = snapshot
                .entry(atom_id.to_string())
                .or_insert_with(|| LedgerEntry::new(atom_id));
            entry.promote(desired);
            result = entry.status;
            Ok(())
        })
        .await?;
        Ok(result)
    }
}
