//! Atom-Ledger: lifecycle persistence for backlog evidence atoms
//!
//! Every evidence atom the miner has ever observed gets one ledger entry
//! whose status only moves forward: `new < ticketed < queued < actioned`.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: monotonic status, deterministic on-disk layout, and a single
//! atomic read-modify-write per invocation.
//!
//! ## Key Components
//!
//! - `AtomStatus`: the ordered lifecycle states
//! - `AtomLedger`: async storage trait (load / update)
//! - `YamlAtomLedger`: YAML file backend (`{version: 1, atoms: [...]}`)
//! - `apply_backlog_observations`: folds one backlog run into the ledger

mod error;
pub mod fakes;
pub mod status;
pub mod storage_traits;
pub mod update;
pub mod yaml_ledger;

pub use error::LedgerError;
pub use status::AtomStatus;
pub use storage_traits::{AtomLedger, LedgerEntry, LedgerResult, LedgerSnapshot};
pub use update::{
    apply_backlog_observations, is_aggregate_atom, AtomObservation, LedgerUpdateStats,
    AGGREGATE_PREFIX,
};
pub use yaml_ledger::YamlAtomLedger;

/// Ledger document format version.
pub const LEDGER_VERSION: u32 = 1;
