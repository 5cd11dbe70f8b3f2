//! Merge judge: ask the agent whether candidate ticket pairs describe the
//! same issue, one pair at a time.
//!
//! Accepting a merge retires both indices and appends the merged ticket, so
//! later candidate pairs that touch either index are skipped. Pairs are
//! therefore judged sequentially.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};
use triage_engine::{build_merge_candidates, TriageInput};

use crate::cache::fs::write_text;
use crate::cache::{self, CacheSlot, CacheStatus};
use crate::context::MiningContext;
use crate::dedup::{dedupe_by_anchor, dedupe_tickets, triage_input};
use crate::domain::digest::atoms_content_digest;
use crate::domain::error::Result;
use crate::domain::ticket::{
    merge_two_tickets, normalize_ticket, parse_first_json_object, ticket_anchor, RawTicket,
};
use crate::obs;
use crate::prompts::render_merge_judge_prompt;

pub const MERGE_JUDGE_DIR: &str = "merge_judge";
pub const MERGE_JUDGE_MANIFEST_VERSION: u32 = 1;

/// Stored verdict for one candidate pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub same_issue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_ticket: Option<Value>,
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(obj)) => !obj.is_empty(),
    }
}

/// Decode a judge answer; `None` when no JSON object can be found.
pub fn parse_merge_decision(raw: &str) -> Option<MergeDecision> {
    let Some(obj) = parse_first_json_object(raw) else {
        warn!(
            code = "merge_decision_parse_failed",
            "merge-judge output was not valid JSON; leaving pair unmerged"
        );
        return None;
    };
    Some(MergeDecision {
        same_issue: truthy(obj.get("same_issue")),
        merged_ticket: obj.get("merged_ticket").filter(|v| v.is_object()).cloned(),
    })
}

/// Ticket to keep for an affirmed pair.
///
/// The judge's ticket is used when it validates and still cites evidence
/// from the pair; otherwise the two tickets are merged deterministically.
fn resolve_merged(decision: &MergeDecision, left: &RawTicket, right: &RawTicket) -> RawTicket {
    let scope: HashSet<&String> = left
        .evidence_atom_ids
        .iter()
        .chain(right.evidence_atom_ids.iter())
        .collect();

    let judged = decision.merged_ticket.as_ref().and_then(|raw| match normalize_ticket(raw, 0) {
        Ok(mut ticket) => {
            ticket.evidence_atom_ids.retain(|id| scope.contains(id));
            if ticket.evidence_atom_ids.is_empty() {
                debug!("judge ticket cites nothing from the pair; using deterministic merge");
                return None;
            }
            ticket.merged_count = left.merged_count.max(1).saturating_add(right.merged_count.max(1));
            Some(ticket)
        }
        Err(reason) => {
            debug!(%reason, "judge ticket invalid; using deterministic merge");
            None
        }
    });
    judged.unwrap_or_else(|| merge_two_tickets(left, right))
}

fn candidate_pairs(ctx: &MiningContext, tickets: &[RawTicket]) -> Vec<(usize, usize)> {
    let inputs: Vec<TriageInput> = tickets.iter().map(triage_input).collect();
    match build_merge_candidates(
        &inputs,
        ctx.embedder.as_ref(),
        &ctx.similarity,
        &ctx.config.merge_candidates,
    ) {
        Ok(pairs) => pairs,
        Err(e) => {
            warn!(code = "merge_candidates_failed", error = %e, "could not rank merge candidates");
            Vec::new()
        }
    }
}

/// Judge candidate pairs and collapse the ones confirmed as the same issue.
///
/// Returns the surviving tickets and the number of pairs evaluated.
#[instrument(skip_all, fields(tickets = tickets.len()))]
pub async fn run_merge_judge(ctx: &MiningContext, tickets: Vec<RawTicket>) -> Result<(Vec<RawTicket>, usize)> {
    let candidates = candidate_pairs(ctx, &tickets);
    if candidates.is_empty() {
        return Ok((tickets, 0));
    }

    let template_name = &ctx.manifest.merge_judge_template;
    let template = ctx.manifest.template(template_name)?;
    let template_sha256 = ctx.manifest.template_sha256(template_name)?;
    let caps = ctx.config.merge_caps;
    let judge_dir = ctx.artifacts_dir.join(MERGE_JUDGE_DIR);
    std::fs::create_dir_all(&judge_dir)?;

    let mut working = tickets;
    let mut inactive: HashSet<usize> = HashSet::new();
    let mut decisions = 0usize;

    for (offset, (left_idx, right_idx)) in candidates.into_iter().enumerate() {
        let index = offset + 1;
        if inactive.contains(&left_idx) || inactive.contains(&right_idx) {
            continue;
        }
        let (Some(left), Some(right)) = (working.get(left_idx), working.get(right_idx)) else {
            continue;
        };

        let evidence_ids: Vec<String> = left
            .evidence_atom_ids
            .iter()
            .chain(right.evidence_atom_ids.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (evidence, included) = ctx
            .catalog
            .select_evidence(&evidence_ids, caps.max_atoms, caps.max_chars);

        let tag = format!("pair_{index:03}");
        let slot = CacheSlot::new(
            format!("{MERGE_JUDGE_DIR}/{tag}.decision.json"),
            format!("{MERGE_JUDGE_DIR}/{tag}.input.json"),
        );
        let manifest = json!({
            "version": MERGE_JUDGE_MANIFEST_VERSION,
            "tag": tag,
            "template": template_name,
            "template_sha256": template_sha256,
            "agent": ctx.executor.agent(),
            "model": ctx.executor.model(),
            "cfg_sha256": ctx.cfg_sha256,
            "max_evidence_atoms": caps.max_atoms,
            "max_evidence_chars": caps.max_chars,
            "evidence_atom_ids_total": evidence_ids,
            "evidence_atom_ids_included": included,
            "evidence_atoms_sha256": atoms_content_digest(evidence.iter().copied()),
            "left_anchor": ticket_anchor(left),
            "right_anchor": ticket_anchor(right),
        });

        let mut cache_status = CacheStatus::Miss;
        let mut decision = None;
        if let Some(hit) = cache::lookup(ctx.store.as_ref(), &slot, &manifest, ctx.lookup_options(false)) {
            match serde_json::from_value::<MergeDecision>(hit.into_value()) {
                Ok(cached) => {
                    cache_status = CacheStatus::Verified;
                    decision = Some(cached);
                }
                Err(e) => cache::report_corruption(&slot.output_key, &e.to_string()),
            }
        }

        let decision = match decision {
            Some(decision) => decision,
            None if ctx.config.dry_run => {
                let prompt = render_merge_judge_prompt(
                    template,
                    &serde_json::to_value(left)?,
                    &serde_json::to_value(right)?,
                    &evidence,
                )?;
                write_text(&judge_dir.join(format!("{tag}.dry_run.prompt.txt")), &prompt)?;
                decisions += 1;
                obs::emit_merge_judge_decided(index, false, false, cache_status.as_str());
                continue;
            }
            None => {
                let prompt = render_merge_judge_prompt(
                    template,
                    &serde_json::to_value(left)?,
                    &serde_json::to_value(right)?,
                    &evidence,
                )?;
                match ctx.executor.run_prompt(&judge_dir, &tag, &prompt).await {
                    Ok(raw) => match parse_merge_decision(&raw) {
                        Some(parsed) => {
                            let output = serde_json::to_value(&parsed)?;
                            if let Err(e) = cache::commit(ctx.store.as_ref(), &slot, &output, &manifest) {
                                warn!(code = "cache_write_failed", error = %e, "could not persist merge decision");
                            }
                            parsed
                        }
                        None => MergeDecision {
                            same_issue: false,
                            merged_ticket: None,
                        },
                    },
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(_) => MergeDecision {
                        same_issue: false,
                        merged_ticket: None,
                    },
                }
            }
        };

        decisions += 1;
        obs::emit_merge_judge_decided(index, decision.same_issue, decision.same_issue, cache_status.as_str());
        if !decision.same_issue {
            continue;
        }

        let merged = resolve_merged(&decision, left, right);
        inactive.insert(left_idx);
        inactive.insert(right_idx);
        working.push(merged);
    }

    let survivors: Vec<RawTicket> = working
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !inactive.contains(idx))
        .map(|(_, ticket)| ticket)
        .collect();
    let deduped = dedupe_tickets(
        survivors,
        ctx.embedder.as_ref(),
        &ctx.similarity,
        &ctx.dedupe_thresholds,
    );
    Ok((dedupe_by_anchor(deduped), decisions))
}
