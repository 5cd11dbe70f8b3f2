//! Labeler ensemble: several stance variants label each ticket, and the
//! consensus is written back onto it.
//!
//! Tickets are independent and run on the bounded pool; the variants of
//! one ticket run in order inside its own `labeler/<fingerprint>/` dir.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::cache::fs::{write_json_pretty, write_text};
use crate::cache::{self, CacheHit, CacheSlot};
use crate::context::MiningContext;
use crate::domain::digest::{atoms_content_digest, json_digest};
use crate::domain::error::Result;
use crate::domain::label::{consensus_label, normalize_label, LabelPayload, LABELER_VARIANTS};
use crate::domain::ticket::{
    parse_first_json_object, ticket_anchor, ticket_fingerprint, RawTicket, Stage, RISK_INTENT_MISMATCH,
};
use crate::obs;
use crate::parallel::run_bounded;
use crate::prompts::render_labeler_prompt;

pub const LABELER_DIR: &str = "labeler";
pub const LABELER_MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelerRunStatus {
    Cached,
    LegacyCached,
    Ok,
    DryRun,
    ParseFailed,
    AgentFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketLabelMeta {
    pub fingerprint: String,
    pub labelers: usize,
    pub valid_labels: usize,
    pub disagreement: bool,
    pub statuses: Vec<LabelerRunStatus>,
}

/// `labeler/meta.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelerMeta {
    pub labelers_total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeler_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeler_template_sha256: Option<String>,
    pub max_evidence_atoms: usize,
    pub max_evidence_chars: usize,
    pub tickets_total: usize,
    pub cached_runs: usize,
    pub legacy_cached_runs: usize,
    pub labeler_runs: usize,
    pub parse_failed: usize,
    pub agent_failed: usize,
    pub tickets_meta: Vec<TicketLabelMeta>,
}

impl LabelerMeta {
    fn count(&mut self, status: LabelerRunStatus) {
        match status {
            LabelerRunStatus::Cached => self.cached_runs += 1,
            LabelerRunStatus::LegacyCached => {
                self.cached_runs += 1;
                self.legacy_cached_runs += 1;
            }
            LabelerRunStatus::Ok => self.labeler_runs += 1,
            LabelerRunStatus::ParseFailed => {
                self.labeler_runs += 1;
                self.parse_failed += 1;
            }
            LabelerRunStatus::AgentFailed => {
                self.labeler_runs += 1;
                self.agent_failed += 1;
            }
            LabelerRunStatus::DryRun => {}
        }
    }
}

/// Variant stance for 1-based labeler index `idx`.
pub fn variant_for(idx: usize) -> &'static str {
    LABELER_VARIANTS[(idx.max(1) - 1) % LABELER_VARIANTS.len()]
}

/// Fold variant labels into `ticket`; returns whether they disagreed.
///
/// Disagreement on a ticket still in triage moves it to research.
pub fn apply_consensus(ticket: &mut RawTicket, labels: &[LabelPayload], max_evidence_ids: usize) -> bool {
    let (consensus, disagreement) = consensus_label(labels, max_evidence_ids);
    ticket.apply_label(&consensus);
    if disagreement && ticket.stage() == Stage::Triage {
        ticket.stage = Some(Stage::ResearchRequired);
        ticket.add_risk(RISK_INTENT_MISMATCH);
    }
    disagreement
}

async fn label_ticket(ctx: Arc<MiningContext>, mut ticket: RawTicket) -> Result<(RawTicket, TicketLabelMeta)> {
    let labelers = ctx.config.labelers;
    let caps = ctx.config.labeler_caps;
    let template_name = &ctx.manifest.labeler_template;
    let template = ctx.manifest.template(template_name)?;
    let template_sha256 = ctx.manifest.template_sha256(template_name)?;

    let fingerprint = ticket_fingerprint(&ticket);
    let key_prefix = format!("{LABELER_DIR}/{fingerprint}");
    let ticket_dir = ctx.artifacts_dir.join(LABELER_DIR).join(&fingerprint);
    std::fs::create_dir_all(&ticket_dir)?;

    let payload = ticket.labeler_payload();
    let (evidence, included) = ctx
        .catalog
        .select_evidence(&ticket.evidence_atom_ids, caps.max_atoms, caps.max_chars);

    let mut labels: Vec<LabelPayload> = Vec::new();
    let mut statuses = Vec::with_capacity(labelers);

    for idx in 1..=labelers {
        let variant = variant_for(idx);
        let tag = format!("labeler_{idx:02}");
        let slot = CacheSlot::new(
            format!("{key_prefix}/{tag}.label.json"),
            format!("{key_prefix}/{tag}.input.json"),
        );
        let manifest = json!({
            "version": LABELER_MANIFEST_VERSION,
            "template": template_name,
            "template_sha256": template_sha256,
            "agent": ctx.executor.agent(),
            "model": ctx.executor.model().unwrap_or_default(),
            "variant": variant,
            "max_evidence_atoms": caps.max_atoms,
            "max_evidence_chars": caps.max_chars,
            "ticket_anchor": ticket_anchor(&ticket),
            "ticket_payload_sha256": json_digest(&payload)?,
            "evidence_atom_ids_total": ticket.evidence_atom_ids,
            "evidence_atom_ids_included": included,
            "evidence_atoms_sha256": atoms_content_digest(evidence.iter().copied()),
            "cfg_sha256": ctx.cfg_sha256,
        });

        if let Some(hit) = cache::lookup(ctx.store.as_ref(), &slot, &manifest, ctx.lookup_options(true)) {
            let legacy = matches!(hit, CacheHit::Legacy(_));
            match serde_json::from_value::<LabelPayload>(hit.into_value()) {
                Ok(label) => {
                    if legacy {
                        warn!(
                            code = "labeler_cache_manifest_missing",
                            fingerprint = %fingerprint,
                            tag = %tag,
                            "using labeler output without a manifest"
                        );
                        if let Err(e) = cache::backfill(ctx.store.as_ref(), &slot, &manifest) {
                            warn!(code = "manifest_backfill_failed", error = %e, "could not backfill input manifest");
                        }
                        statuses.push(LabelerRunStatus::LegacyCached);
                    } else {
                        statuses.push(LabelerRunStatus::Cached);
                    }
                    labels.push(label);
                    continue;
                }
                Err(e) => cache::report_corruption(&slot.output_key, &e.to_string()),
            }
        }

        let prompt = render_labeler_prompt(template, variant, &payload, &evidence)?;
        if ctx.config.dry_run {
            write_text(&ticket_dir.join(format!("{tag}.dry_run.prompt.txt")), &prompt)?;
            statuses.push(LabelerRunStatus::DryRun);
            continue;
        }

        let raw = match ctx.executor.run_prompt(&ticket_dir, &tag, &prompt).await {
            Ok(raw) => raw,
            Err(e) if e.is_fatal() => return Err(e),
            Err(_) => {
                statuses.push(LabelerRunStatus::AgentFailed);
                continue;
            }
        };
        let Some(obj) = parse_first_json_object(&raw) else {
            write_text(&ticket_dir.join(format!("{tag}.parse_error.txt")), &format!("{}\n", raw.trim()))?;
            statuses.push(LabelerRunStatus::ParseFailed);
            continue;
        };
        let label = normalize_label(&Value::Object(obj));
        let output = serde_json::to_value(&label)?;
        if let Err(e) = cache::commit(ctx.store.as_ref(), &slot, &output, &manifest) {
            warn!(code = "cache_write_failed", error = %e, "could not persist label");
        }
        labels.push(label);
        statuses.push(LabelerRunStatus::Ok);
    }

    let disagreement = apply_consensus(&mut ticket, &labels, ctx.config.labeler_max_evidence_ids_used);
    write_json_pretty(
        &ticket_dir.join("consensus.json"),
        &json!({
            "fingerprint": fingerprint,
            "variants": labels.len(),
            "disagreement": disagreement,
            "change_surface": ticket.change_surface,
            "component": ticket.component,
            "intent_risk": ticket.intent_risk,
            "labeler_confidence": ticket.labeler_confidence,
            "labeler_evidence_atom_ids_used": ticket.labeler_evidence_atom_ids_used,
            "stage": ticket.stage(),
        }),
    )?;
    obs::emit_labeler_ticket(&fingerprint, labels.len(), disagreement);

    let meta = TicketLabelMeta {
        fingerprint,
        labelers,
        valid_labels: labels.len(),
        disagreement,
        statuses,
    };
    Ok((ticket, meta))
}

/// Label every ticket and write `labeler/meta.json`.
///
/// With zero labelers or no tickets the tickets pass through untouched.
#[instrument(skip_all, fields(tickets = tickets.len(), labelers = ctx.config.labelers))]
pub async fn run_labelers(ctx: &Arc<MiningContext>, tickets: Vec<RawTicket>) -> Result<(Vec<RawTicket>, LabelerMeta)> {
    let caps = ctx.config.labeler_caps;
    let mut meta = LabelerMeta {
        labelers_total: ctx.config.labelers,
        max_evidence_atoms: caps.max_atoms,
        max_evidence_chars: caps.max_chars,
        tickets_total: tickets.len(),
        ..LabelerMeta::default()
    };
    if ctx.config.labelers == 0 || tickets.is_empty() {
        return Ok((tickets, meta));
    }
    let template_name = ctx.manifest.labeler_template.clone();
    meta.labeler_template_sha256 = Some(ctx.manifest.template_sha256(&template_name)?);
    meta.labeler_template = Some(template_name);

    let originals = tickets.clone();
    let results = run_bounded(tickets, ctx.config.max_concurrent, |_, ticket| {
        label_ticket(Arc::clone(ctx), ticket)
    })
    .await;

    let mut by_index: Vec<Option<(RawTicket, TicketLabelMeta)>> = vec![None; originals.len()];
    for (idx, result) in results {
        match result {
            Ok(done) => by_index[idx] = Some(done),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(code = "labeler_ticket_failed", error = %e, "labeling failed; keeping ticket unlabeled"),
        }
    }

    let mut labeled = Vec::with_capacity(originals.len());
    for (original, done) in originals.into_iter().zip(by_index) {
        match done {
            Some((ticket, ticket_meta)) => {
                for status in &ticket_meta.statuses {
                    meta.count(*status);
                }
                meta.tickets_meta.push(ticket_meta);
                labeled.push(ticket);
            }
            None => labeled.push(original),
        }
    }

    write_json_pretty(&ctx.artifacts_dir.join(LABELER_DIR).join("meta.json"), &meta)?;
    Ok((labeled, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MiningConfig;
    use crate::domain::atom::Atom;
    use crate::domain::label::{ChangeSurfaceKind, Component};
    use crate::fakes::{MemoryResultStore, ScriptedAdapter};
    use crate::prompts::PromptManifest;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manifest() -> PromptManifest {
        let templates: BTreeMap<String, String> = ["cov.md", "bag.md", "orphan.md", "merge.md", "label.md"]
            .iter()
            .map(|n| (n.to_string(), format!("{n} {{{{LABELER_VARIANT}}}}\n{{{{TICKET_JSON}}}}")))
            .collect();
        PromptManifest::from_parts(
            "prompts",
            vec!["cov.md".into()],
            vec!["bag.md".into()],
            "orphan.md",
            "merge.md",
            "label.md",
            templates,
        )
        .unwrap()
    }

    fn context(adapter: Arc<ScriptedAdapter>, dir: &std::path::Path, config: MiningConfig) -> Arc<MiningContext> {
        let atoms = vec![Atom::new("a1", "run1", "confusion_point", "flag docs are wrong")];
        Arc::new(
            MiningContext::new(adapter, manifest(), atoms, dir, config)
                .unwrap()
                .with_store(Arc::new(MemoryResultStore::new())),
        )
    }

    #[test]
    fn variants_rotate() {
        assert_eq!(variant_for(1), "conservative");
        assert_eq!(variant_for(3), "skeptical");
        assert_eq!(variant_for(4), "conservative");
    }

    #[tokio::test]
    async fn majority_kinds_win_and_disagreement_demotes() {
        let dir = tempfile::tempdir().unwrap();
        let n = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&n);
        let adapter = Arc::new(ScriptedAdapter::new(move |_| {
            let kind = if counter.fetch_add(1, Ordering::SeqCst) == 2 { "new_flag" } else { "docs_change" };
            Ok(format!(
                r#"{{"change_surface": {{"user_visible": true, "kinds": ["{kind}"]}}, "component": "docs", "intent_risk": "low", "confidence": 0.6}}"#
            ))
        }));
        let ctx = context(adapter.clone(), dir.path(), MiningConfig::default());
        let (tickets, meta) = run_labelers(&ctx, vec![RawTicket::new("Docs wrong", &["a1"])]).await.unwrap();

        let t = &tickets[0];
        assert_eq!(t.change_surface.as_ref().unwrap().kinds, vec![ChangeSurfaceKind::DocsChange]);
        assert_eq!(t.component, Some(Component::Docs));
        assert_eq!(t.stage(), Stage::ResearchRequired);
        assert_eq!(t.risks, vec![RISK_INTENT_MISMATCH]);
        assert_eq!(meta.labeler_runs, 3);
        assert!(meta.tickets_meta[0].disagreement);

        let fp = ticket_fingerprint(&RawTicket::new("Docs wrong", &["a1"]));
        assert!(dir.path().join(format!("labeler/{fp}/consensus.json")).is_file());
        assert!(dir.path().join("labeler/meta.json").is_file());
        assert!(adapter.prompts()[1].starts_with("label.md balanced"));
    }

    #[tokio::test]
    async fn second_run_reuses_labels() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(ScriptedAdapter::constant(
            r#"{"change_surface": {"kinds": ["docs_change"]}, "component": "docs"}"#,
        ));
        let ctx = context(adapter.clone(), dir.path(), MiningConfig::default());
        let ticket = RawTicket::new("Docs wrong", &["a1"]);
        run_labelers(&ctx, vec![ticket.clone()]).await.unwrap();
        let (_, meta) = run_labelers(&ctx, vec![ticket]).await.unwrap();
        assert_eq!(adapter.calls(), 3);
        assert_eq!(meta.cached_runs, 3);
        assert_eq!(meta.labeler_runs, 0);
    }

    #[tokio::test]
    async fn zero_labelers_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(ScriptedAdapter::constant("{}"));
        let config = MiningConfig {
            labelers: 0,
            ..MiningConfig::default()
        };
        let ctx = context(adapter.clone(), dir.path(), config);
        let ticket = RawTicket::new("Docs wrong", &["a1"]);
        let (tickets, meta) = run_labelers(&ctx, vec![ticket.clone()]).await.unwrap();
        assert_eq!(tickets, vec![ticket]);
        assert_eq!(meta.tickets_total, 1);
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn unparseable_label_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(ScriptedAdapter::constant("I cannot label this."));
        let config = MiningConfig {
            labelers: 1,
            ..MiningConfig::default()
        };
        let ctx = context(adapter, dir.path(), config);
        let (tickets, meta) = run_labelers(&ctx, vec![RawTicket::new("Docs wrong", &["a1"])]).await.unwrap();
        assert_eq!(meta.parse_failed, 1);
        assert_eq!(meta.tickets_meta[0].statuses, vec![LabelerRunStatus::ParseFailed]);
        assert_eq!(tickets[0].stage(), Stage::ResearchRequired);
    }
}
