//! Orphan recovery: re-mine high-severity atoms no ticket cites yet.
//!
//! Each pass reads the coverage left by the previous one, so passes run
//! strictly one after another.

use tracing::{debug, instrument};

use crate::backlog::{compute_coverage, COVERAGE_PREVIEW_LIMIT};
use crate::context::MiningContext;
use crate::dedup::dedupe_tickets;
use crate::domain::atom::Atom;
use crate::domain::error::Result;
use crate::domain::ticket::RawTicket;
use crate::miner::{run_miner_job, MinerMeta};
use crate::obs;
use crate::planner::{plan_orphan_job, AtomWeights};

pub const ORPHAN_DIR: &str = "orphan_pass";

#[derive(Debug, Clone)]
pub struct OrphanOutcome {
    pub tickets: Vec<RawTicket>,
    pub jobs: Vec<MinerMeta>,
    pub passes_run: usize,
}

/// Run up to `orphan_passes` recovery passes over `tickets`.
///
/// Stops early when no high-severity atom is left uncovered or the sample
/// comes back empty. New tickets are folded in with the dedup pass.
#[instrument(skip_all, fields(passes = ctx.config.orphan_passes))]
pub async fn run_orphan_passes(ctx: &MiningContext, tickets: Vec<RawTicket>) -> Result<OrphanOutcome> {
    let atoms = ctx.catalog.atoms();
    let weights = AtomWeights::default();
    let mut current = tickets;
    let mut jobs = Vec::new();
    let mut passes_run = 0usize;

    for pass_idx in 1..=ctx.config.orphan_passes {
        let coverage = compute_coverage(atoms, &current, COVERAGE_PREVIEW_LIMIT);
        if coverage.uncovered_high_severity_atom_ids.is_empty() {
            debug!(pass = pass_idx, "no uncovered high-severity atoms");
            break;
        }
        let uncovered: Vec<Atom> = atoms
            .iter()
            .filter(|a| coverage.uncovered_high_severity_atom_ids.contains(&a.atom_id))
            .cloned()
            .collect();

        let Some(job) = plan_orphan_job(
            &uncovered,
            &ctx.manifest,
            ctx.config.sample_size,
            ctx.config.seed,
            pass_idx,
            &weights,
        ) else {
            break;
        };

        passes_run += 1;
        let sampled = job.atoms.len();
        let outcome = run_miner_job(ctx, &job, ORPHAN_DIR).await?;
        jobs.push(outcome.meta);
        if !outcome.tickets.is_empty() {
            current.extend(outcome.tickets);
            current = dedupe_tickets(
                current,
                ctx.embedder.as_ref(),
                &ctx.similarity,
                &ctx.dedupe_thresholds,
            );
        }
        obs::emit_orphan_pass(pass_idx, uncovered.len(), sampled, current.len());
    }

    Ok(OrphanOutcome {
        tickets: current,
        jobs,
        passes_run,
    })
}
