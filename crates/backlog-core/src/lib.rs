//! Backlog Core Library
//!
//! Resumable ensemble mining engine: turns agent-run evidence atoms into a
//! deduplicated, labeled and evidence-gated backlog.
//!
//! ## Layer 2 - Mining Engine
//!
//! ## Key Components
//!
//! - `planner`: deterministic coverage / bagging / orphan jobs
//! - `cache`: input-manifest resume discipline over a `ResultStore`
//! - `executor`: prompt, parse, one repair attempt
//! - `dedup` / `merge_judge`: clustering and pairwise consensus merges
//! - `orphan`: re-mining of uncovered high-severity atoms
//! - `labeler`: rotating-stance label ensemble with majority consensus
//! - `enrich` / `backlog`: breadth, trust, stage gate, final document
//! - `pipeline`: the end-to-end run

pub mod adapter;
pub mod backlog;
pub mod cache;
pub mod config;
pub mod context;
pub mod dedup;
pub mod domain;
pub mod enrich;
pub mod executor;
pub mod fakes;
pub mod labeler;
pub mod ledger_sync;
pub mod merge_judge;
pub mod metrics;
pub mod miner;
pub mod obs;
pub mod orphan;
pub mod parallel;
pub mod pipeline;
pub mod planner;
pub mod prompts;
pub mod telemetry;

pub use adapter::{AgentAdapter, AgentRequest, AgentResponse};
pub use backlog::{
    build_backlog_document, compute_coverage, render_markdown, write_backlog, BacklogDocument,
    Coverage, Totals, DEFAULT_TITLE,
};
pub use cache::fs::FsResultStore;
pub use cache::{CacheError, CacheStatus, ResultStore};
pub use config::{EvidenceCaps, MiningConfig};
pub use context::MiningContext;
pub use domain::{
    parse_atoms, read_atoms, Atom, AtomCatalog, BacklogError, RawTicket, Result, Severity, Stage,
};
pub use enrich::{EnrichedTicket, RISK_MODEL_BREADTH, RISK_RUN_BREADTH};
pub use labeler::LabelerMeta;
pub use ledger_sync::{filter_atoms_by_ledger, update_ledger, LedgerExclusion, DEFAULT_EXCLUDED_STATUSES};
pub use miner::{MinerMeta, MinersMeta, UnitStatus};
pub use pipeline::{mine_backlog, plan_document, plan_jobs};
pub use planner::{MinerJob, PassType, PlanConfig};
pub use prompts::{load_prompt_manifest, PromptManifest};
pub use telemetry::init_tracing;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
