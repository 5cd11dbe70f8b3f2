//! One miner job under the resume-cache discipline.
//!
//! Layout per job: `<artifacts>/<subdir>/<tag>/` holding the prompt/response
//! artifacts, `tickets.json`, `input_manifest.json`, `meta.json` and, when
//! parsing had problems, `parse_error.txt`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::cache::fs::{write_json_pretty, write_text};
use crate::cache::{self, CacheHit, CacheSlot, CacheStatus};
use crate::context::MiningContext;
use crate::domain::digest::{atoms_content_digest, json_digest};
use crate::domain::error::Result;
use crate::domain::ticket::RawTicket;
use crate::obs;
use crate::planner::{MinerJob, PassType, SampleSemantics};
use crate::prompts::render_miner_prompt;

/// Input manifest format written next to miner outputs.
pub const MINER_MANIFEST_VERSION: u32 = 2;

/// Outcome of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Ok,
    Empty,
    ParseFailed,
    AgentFailed,
    DryRun,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Ok => "ok",
            UnitStatus::Empty => "empty",
            UnitStatus::ParseFailed => "parse_failed",
            UnitStatus::AgentFailed => "agent_failed",
            UnitStatus::DryRun => "dry_run",
        }
    }

    /// Counted as a completed miner in run metadata.
    pub fn is_completed(self) -> bool {
        matches!(self, UnitStatus::Ok | UnitStatus::Empty | UnitStatus::DryRun)
    }
}

/// `meta.json` of one miner job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerMeta {
    pub tag: String,
    pub pass_type: PassType,
    pub template: String,
    pub template_sha256: String,
    pub atom_count: usize,
    pub atoms_content_sha256: String,
    pub input_manifest_digest: String,
    pub cache: CacheStatus,
    pub status: UnitStatus,
    pub ticket_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parse_errors: Vec<String>,
    #[serde(default)]
    pub repaired: bool,
}

#[derive(Debug, Clone)]
pub struct MinerOutcome {
    pub tickets: Vec<RawTicket>,
    pub meta: MinerMeta,
}

/// Run-level summary of every miner job, including orphan passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinersMeta {
    pub miners_total: usize,
    pub miners_completed: usize,
    pub miners_failed: usize,
    pub merge_decisions: usize,
    pub sample_size_semantics: SampleSemantics,
    pub sample_size_requested: usize,
    pub orphan_passes_requested: usize,
    pub orphan_passes_run: usize,
    pub prompt_manifest: Value,
    pub jobs: Vec<MinerMeta>,
}

impl MinersMeta {
    pub fn new(sample_size: usize, orphan_passes: usize, prompt_manifest: Value) -> Self {
        Self {
            miners_total: 0,
            miners_completed: 0,
            miners_failed: 0,
            merge_decisions: 0,
            sample_size_semantics: SampleSemantics::for_size(sample_size),
            sample_size_requested: sample_size,
            orphan_passes_requested: orphan_passes,
            orphan_passes_run: 0,
            prompt_manifest,
            jobs: Vec::new(),
        }
    }

    pub fn record(&mut self, meta: MinerMeta) {
        self.miners_total += 1;
        if meta.status.is_completed() {
            self.miners_completed += 1;
        } else {
            self.miners_failed += 1;
        }
        self.jobs.push(meta);
    }
}

fn miner_manifest(ctx: &MiningContext, job: &MinerJob, template_sha256: &str, atoms_sha256: &str) -> Value {
    json!({
        "version": MINER_MANIFEST_VERSION,
        "job_tag": job.tag,
        "pass_type": job.pass_type,
        "template": job.template,
        "template_sha256": template_sha256,
        "agent": ctx.executor.agent(),
        "model": ctx.executor.model(),
        "cfg_sha256": ctx.cfg_sha256,
        "max_tickets_per_miner": ctx.config.max_tickets_per_miner,
        "atom_count": job.atoms.len(),
        "atoms_content_sha256": atoms_sha256,
        "atom_ids": job.atom_ids(),
        "selection_params": job.selection_params,
        "prompt_manifest": ctx.manifest.summary(),
    })
}

/// Decode cached tickets and check they stay inside the job's atoms.
fn cached_tickets(value: Value, allowed: &HashSet<String>) -> std::result::Result<Vec<RawTicket>, String> {
    let tickets: Vec<RawTicket> =
        serde_json::from_value(value).map_err(|e| format!("not a ticket list: {e}"))?;
    for (idx, ticket) in tickets.iter().enumerate() {
        if ticket.evidence_atom_ids.is_empty() {
            return Err(format!("tickets[{idx}] has no evidence"));
        }
        if let Some(id) = ticket.evidence_atom_ids.iter().find(|id| !allowed.contains(*id)) {
            return Err(format!("tickets[{idx}] cites atom {id} outside the job"));
        }
    }
    Ok(tickets)
}

/// Drop evidence outside the job and reject tickets left without any.
fn restrict_to_scope(
    tickets: Vec<RawTicket>,
    allowed: &HashSet<String>,
    errors: &mut Vec<String>,
) -> Vec<RawTicket> {
    let mut kept = Vec::with_capacity(tickets.len());
    for (idx, mut ticket) in tickets.into_iter().enumerate() {
        let before = ticket.evidence_atom_ids.len();
        ticket.evidence_atom_ids.retain(|id| allowed.contains(id));
        if ticket.evidence_atom_ids.len() < before {
            warn!(
                code = "evidence_out_of_scope",
                title = %ticket.title,
                dropped = before - ticket.evidence_atom_ids.len(),
                "dropping evidence ids the miner was not shown"
            );
        }
        if ticket.evidence_atom_ids.is_empty() {
            errors.push(format!("tickets[{idx}] cites no atoms from this job"));
            continue;
        }
        kept.push(ticket);
    }
    kept
}

fn write_parse_errors(dir: &Path, errors: &[String]) -> Result<()> {
    let path = dir.join("parse_error.txt");
    if errors.is_empty() {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        return Ok(());
    }
    write_text(&path, &format!("{}\n", errors.join("\n")))?;
    Ok(())
}

/// Run one miner job, reusing a cached result when its manifest matches.
///
/// Only configuration problems are returned as errors. Agent failures and
/// unparseable output become [`UnitStatus`] values in the returned meta.
#[instrument(skip(ctx, job), fields(tag = %job.tag, pass_type = job.pass_type.as_str()))]
pub async fn run_miner_job(ctx: &MiningContext, job: &MinerJob, subdir: &str) -> Result<MinerOutcome> {
    let key_prefix = format!("{subdir}/{}", job.tag);
    let job_dir = ctx.artifacts_dir.join(subdir).join(&job.tag);
    std::fs::create_dir_all(&job_dir)?;
    let slot = CacheSlot::new(
        format!("{key_prefix}/tickets.json"),
        format!("{key_prefix}/input_manifest.json"),
    );

    let template = ctx.manifest.template(&job.template)?;
    let template_sha256 = ctx.manifest.template_sha256(&job.template)?;
    let atoms_sha256 = atoms_content_digest(&job.atoms);
    let manifest = miner_manifest(ctx, job, &template_sha256, &atoms_sha256);
    let allowed: HashSet<String> = job.atom_ids().into_iter().collect();

    let mut meta = MinerMeta {
        tag: job.tag.clone(),
        pass_type: job.pass_type,
        template: job.template.clone(),
        template_sha256,
        atom_count: job.atoms.len(),
        atoms_content_sha256: atoms_sha256,
        input_manifest_digest: json_digest(&manifest)?,
        cache: CacheStatus::Miss,
        status: UnitStatus::Empty,
        ticket_count: 0,
        parse_errors: Vec::new(),
        repaired: false,
    };

    let finish = |meta: MinerMeta, tickets: Vec<RawTicket>| -> Result<MinerOutcome> {
        write_json_pretty(&job_dir.join("meta.json"), &meta)?;
        obs::emit_miner_finished(
            &meta.tag,
            meta.pass_type.as_str(),
            meta.status.as_str(),
            meta.cache.as_str(),
            tickets.len(),
        );
        Ok(MinerOutcome { tickets, meta })
    };

    if job.atoms.is_empty() {
        debug!("job has no atoms; skipping agent call");
        return finish(meta, Vec::new());
    }

    if let Some(hit) = cache::lookup(ctx.store.as_ref(), &slot, &manifest, ctx.lookup_options(true)) {
        let status = hit.status();
        let legacy = matches!(hit, CacheHit::Legacy(_));
        match cached_tickets(hit.into_value(), &allowed) {
            Ok(tickets) => {
                if legacy {
                    if let Err(e) = cache::backfill(ctx.store.as_ref(), &slot, &manifest) {
                        warn!(code = "manifest_backfill_failed", error = %e, "could not backfill input manifest");
                    }
                }
                meta.cache = status;
                meta.status = if tickets.is_empty() { UnitStatus::Empty } else { UnitStatus::Ok };
                meta.ticket_count = tickets.len();
                return finish(meta, tickets);
            }
            Err(reason) => cache::report_corruption(&slot.output_key, &reason),
        }
    }

    let prompt = render_miner_prompt(template, &job.atoms, ctx.config.max_tickets_per_miner)?;

    if ctx.config.dry_run {
        write_text(&job_dir.join("dry_run.prompt.txt"), &prompt)?;
        meta.status = UnitStatus::DryRun;
        return finish(meta, Vec::new());
    }

    let run = match ctx
        .executor
        .run_ticket_prompt(&job_dir, &job.tag, &prompt, ctx.config.max_tickets_per_miner)
        .await
    {
        Ok(run) => run,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            meta.status = UnitStatus::AgentFailed;
            meta.parse_errors = vec![e.to_string()];
            return finish(meta, Vec::new());
        }
    };

    let mut errors = run.errors;
    let mut tickets = restrict_to_scope(run.tickets, &allowed, &mut errors);
    let cap = ctx.config.max_tickets_per_miner;
    if cap > 0 && tickets.len() > cap {
        debug!(returned = tickets.len(), cap, "truncating tickets to the per-miner cap");
        tickets.truncate(cap);
    }

    meta.status = if !tickets.is_empty() {
        UnitStatus::Ok
    } else if !errors.is_empty() {
        UnitStatus::ParseFailed
    } else {
        UnitStatus::Empty
    };
    meta.ticket_count = tickets.len();
    meta.repaired = run.repaired;
    write_parse_errors(&job_dir, &errors)?;
    meta.parse_errors = errors;

    if meta.status != UnitStatus::ParseFailed {
        let output = serde_json::to_value(&tickets)?;
        if let Err(e) = cache::commit(ctx.store.as_ref(), &slot, &output, &manifest) {
            warn!(code = "cache_write_failed", error = %e, "could not persist miner output");
        }
    }

    finish(meta, tickets)
}
