//! End-to-end mining run: plan, mine, dedupe, judge, recover orphans,
//! label, enrich.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::backlog::{build_backlog_document, BacklogDocument, DocumentParts};
use crate::cache::fs::write_json_pretty;
use crate::context::MiningContext;
use crate::dedup::dedupe_tickets;
use crate::domain::error::Result;
use crate::domain::ticket::{dedupe_by_anchor, RawTicket};
use crate::labeler::{run_labelers, LABELER_DIR};
use crate::merge_judge::{run_merge_judge, MERGE_JUDGE_DIR};
use crate::metrics::METRICS;
use crate::miner::{run_miner_job, MinerOutcome, MinersMeta};
use crate::obs;
use crate::orphan::{run_orphan_passes, ORPHAN_DIR};
use crate::parallel::run_bounded;
use crate::planner::{plan_miner_jobs, MinerJob, PassType, PlanConfig};

pub const MINERS_DIR: &str = "miners";
pub const PLAN_FILE: &str = "plan.json";

/// Deterministic job plan for the context's atoms and knobs.
pub fn plan_jobs(ctx: &MiningContext) -> Result<Vec<MinerJob>> {
    plan_miner_jobs(ctx.catalog.atoms(), &ctx.manifest, &PlanConfig::from(&ctx.config))
}

/// JSON view of a plan, as printed by `backlog plan` and stored as
/// `plan.json` next to the job artifacts.
pub fn plan_document(jobs: &[MinerJob]) -> Value {
    Value::Array(jobs.iter().map(MinerJob::plan_entry).collect())
}

async fn run_pass(ctx: &Arc<MiningContext>, jobs: Vec<MinerJob>, meta: &mut MinersMeta) -> Result<Vec<RawTicket>> {
    let results = run_bounded(jobs, ctx.config.max_concurrent, |_, job| {
        let ctx = Arc::clone(ctx);
        async move { run_miner_job(&ctx, &job, MINERS_DIR).await }
    })
    .await;

    let mut tickets = Vec::new();
    for (idx, result) in results {
        match result {
            Ok(MinerOutcome { tickets: found, meta: job_meta }) => {
                meta.record(job_meta);
                tickets.extend(found);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(code = "miner_job_failed", job_index = idx, error = %e, "miner job failed");
                meta.miners_total += 1;
                meta.miners_failed += 1;
            }
        }
    }
    Ok(tickets)
}

/// Run the whole pipeline and return the backlog document.
///
/// Per-unit failures surface only in the run metadata; the only errors
/// returned are configuration errors and failures to write shared
/// artifacts.
pub async fn mine_backlog(ctx: Arc<MiningContext>, input: Value) -> Result<BacklogDocument> {
    let run_id = Uuid::new_v4().to_string();
    let span = obs::run_span(&run_id);
    mine_inner(ctx, input, run_id).instrument(span).await
}

async fn mine_inner(ctx: Arc<MiningContext>, input: Value, run_id: String) -> Result<BacklogDocument> {
    let started = Instant::now();
    let jobs = plan_jobs(&ctx)?;
    write_json_pretty(&ctx.artifacts_dir.join(PLAN_FILE), &plan_document(&jobs))?;
    obs::emit_mine_started(&run_id, ctx.catalog.len(), jobs.len(), ctx.executor.agent());

    let mut miners_meta = MinersMeta::new(
        ctx.config.sample_size,
        ctx.config.orphan_passes,
        ctx.manifest.summary(),
    );

    let (coverage, bagging): (Vec<MinerJob>, Vec<MinerJob>) = jobs
        .into_iter()
        .partition(|job| job.pass_type == PassType::Coverage);
    let mut tickets = run_pass(&ctx, coverage, &mut miners_meta).await?;
    tickets.extend(run_pass(&ctx, bagging, &mut miners_meta).await?);
    info!(raw_tickets = tickets.len(), "miner passes complete");

    let mut tickets = dedupe_tickets(
        tickets,
        ctx.embedder.as_ref(),
        &ctx.similarity,
        &ctx.dedupe_thresholds,
    );

    if ctx.config.merge_enabled && tickets.len() > 1 {
        let (merged, decisions) = run_merge_judge(&ctx, tickets).await?;
        miners_meta.merge_decisions = decisions;
        tickets = merged;
    }

    if ctx.config.orphan_passes > 0 {
        let orphan = run_orphan_passes(&ctx, tickets).await?;
        for job_meta in orphan.jobs {
            miners_meta.record(job_meta);
        }
        miners_meta.orphan_passes_run = orphan.passes_run;
        tickets = orphan.tickets;
    }

    // Labeler dirs and ledger ticket ids are keyed by anchor.
    let tickets = dedupe_by_anchor(tickets);
    let (tickets, labelers_meta) = run_labelers(&ctx, tickets).await?;

    let mut artifacts = BTreeMap::new();
    let dir = &ctx.artifacts_dir;
    artifacts.insert("artifacts_dir".to_string(), dir.display().to_string());
    artifacts.insert("plan".to_string(), dir.join(PLAN_FILE).display().to_string());
    artifacts.insert("miners_dir".to_string(), dir.join(MINERS_DIR).display().to_string());
    artifacts.insert("merge_judge_dir".to_string(), dir.join(MERGE_JUDGE_DIR).display().to_string());
    artifacts.insert("orphan_pass_dir".to_string(), dir.join(ORPHAN_DIR).display().to_string());
    artifacts.insert("labeler_dir".to_string(), dir.join(LABELER_DIR).display().to_string());

    let miners_failed = miners_meta.miners_failed;
    let doc = build_backlog_document(
        &ctx.catalog,
        tickets,
        ctx.trust.as_ref(),
        DocumentParts {
            generated_at: Utc::now(),
            input,
            miners_meta,
            labelers_meta: (ctx.config.labelers > 0).then_some(labelers_meta),
            artifacts,
        },
    );

    METRICS.flush();
    obs::emit_mine_finished(
        &run_id,
        started.elapsed().as_millis() as u64,
        doc.tickets.len(),
        miners_failed,
    );
    Ok(doc)
}
