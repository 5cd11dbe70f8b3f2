//! Ticket enrichment: evidence breadth, trust, the stage gate and final
//! ordering with display ids.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use triage_engine::{TrustAssessment, TrustAssessor, TrustEvidence};

use crate::domain::atom::{Atom, AtomCatalog, Severity};
use crate::domain::label::ChangeSurface;
use crate::domain::ticket::{RawTicket, Stage};

pub const RISK_RUN_BREADTH: &str = "insufficient_run_breadth_for_non_high_severity";
pub const RISK_MODEL_BREADTH: &str = "insufficient_model_breadth_for_low_severity";

/// Evidence atoms shown inline per ticket.
pub const EVIDENCE_PREVIEW_LIMIT: usize = 5;
const PREVIEW_TEXT_CHARS: usize = 200;

/// Trust weight per atom source; anything else weighs [`DEFAULT_TRUST_WEIGHT`].
pub const TRUST_SOURCE_WEIGHTS: &[(&str, f64)] = &[
    ("run_failure_event", 1.0),
    ("error_json", 0.95),
    ("report_validation_error", 0.90),
    ("agent_stderr_artifact", 0.85),
    ("agent_last_message_artifact", 0.75),
    ("capability_warning", 0.20),
    ("capability_notice", 0.20),
    ("confusion_point", 0.70),
    ("suggested_change", 0.65),
    ("confidence_missing", 0.45),
];
pub const DEFAULT_TRUST_WEIGHT: f64 = 0.55;

pub fn trust_weight(source: &str) -> f64 {
    TRUST_SOURCE_WEIGHTS
        .iter()
        .find(|(name, _)| *name == source)
        .map(|(_, w)| *w)
        .unwrap_or(DEFAULT_TRUST_WEIGHT)
}

/// Short form of an atom for documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomPreview {
    pub atom_id: String,
    pub run_rel: Option<String>,
    pub source: String,
    pub severity_hint: Severity,
    pub text: String,
}

impl AtomPreview {
    pub fn of(atom: &Atom) -> Self {
        let text = if atom.text.chars().count() > PREVIEW_TEXT_CHARS {
            let head: String = atom.text.chars().take(PREVIEW_TEXT_CHARS).collect();
            format!("{head}...")
        } else {
            atom.text.clone()
        };
        Self {
            atom_id: atom.atom_id.clone(),
            run_rel: atom.run_rel.clone(),
            source: atom.source.clone(),
            severity_hint: atom.severity_hint,
            text,
        }
    }
}

/// Distinct provenance counts over a ticket's evidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadth {
    pub runs: usize,
    pub missions: usize,
    pub targets: usize,
    pub repo_inputs: usize,
    pub agents: usize,
    pub personas: usize,
}

/// Ticket as it appears in the backlog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTicket {
    pub ticket_id: String,
    #[serde(flatten)]
    pub ticket: RawTicket,
    pub breadth: Breadth,
    pub runs_citing: usize,
    pub run_refs: Vec<String>,
    pub repo_inputs_citing: Vec<String>,
    pub agents_citing: Vec<String>,
    pub trust: TrustAssessment,
    pub evidence_atoms_preview: Vec<AtomPreview>,
}

fn distinct<'a>(atoms: &[&'a Atom], field: impl Fn(&'a Atom) -> Option<&'a String>) -> Vec<String> {
    atoms
        .iter()
        .filter_map(|atom| field(*atom))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Demote tickets whose evidence is too narrow for their severity.
///
/// Low and medium severity need at least two distinct runs; low severity
/// also needs at least two distinct agents. High and blocker are never
/// breadth-blocked.
pub fn apply_stage_gate(ticket: &mut RawTicket, runs: usize, agents: usize) {
    if matches!(ticket.severity, Severity::Low | Severity::Medium) && runs < 2 {
        ticket.stage = Some(Stage::Blocked);
        ticket.add_risk(RISK_RUN_BREADTH);
    }
    if ticket.severity == Severity::Low && agents < 2 {
        ticket.stage = Some(Stage::Blocked);
        ticket.add_risk(RISK_MODEL_BREADTH);
    }
}

/// Attach breadth, trust and previews, and apply the stage gate.
///
/// `ticket_id` is left empty; [`enrich_tickets`] assigns it after sorting.
pub fn enrich_ticket(mut ticket: RawTicket, catalog: &AtomCatalog, trust: &dyn TrustAssessor) -> EnrichedTicket {
    let evidence: Vec<&Atom> = ticket
        .evidence_atom_ids
        .iter()
        .filter_map(|id| catalog.get(id))
        .collect();

    let run_refs = distinct(&evidence, |a| a.run_rel.as_ref());
    let agents_citing = distinct(&evidence, |a| a.agent.as_ref());
    let repo_inputs_citing = distinct(&evidence, |a| a.repo_input.as_ref());
    let breadth = Breadth {
        runs: run_refs.len(),
        missions: distinct(&evidence, |a| a.mission_id.as_ref()).len(),
        targets: distinct(&evidence, |a| a.target_slug.as_ref()).len(),
        repo_inputs: repo_inputs_citing.len(),
        agents: agents_citing.len(),
        personas: distinct(&evidence, |a| a.persona_id.as_ref()).len(),
    };

    if ticket.change_surface.is_none() {
        ticket.change_surface = Some(ChangeSurface::default());
    }
    if ticket.stage.is_none() {
        ticket.stage = Some(Stage::Triage);
    }
    apply_stage_gate(&mut ticket, breadth.runs, breadth.agents);

    let trust_evidence: Vec<TrustEvidence> = evidence
        .iter()
        .map(|atom| TrustEvidence {
            evidence_id: Some(atom.atom_id.clone()),
            group: atom.run_rel.clone(),
            source: atom.agent.clone(),
            kind: Some(atom.source.clone()).filter(|s| !s.is_empty()),
            weight: trust_weight(&atom.source),
        })
        .collect();
    let trust = trust.assess(&trust_evidence, Some(ticket.confidence));

    EnrichedTicket {
        ticket_id: String::new(),
        runs_citing: breadth.runs,
        breadth,
        run_refs,
        repo_inputs_citing,
        agents_citing,
        trust,
        evidence_atoms_preview: evidence
            .iter()
            .take(EVIDENCE_PREVIEW_LIMIT)
            .map(|a| AtomPreview::of(a))
            .collect(),
        ticket,
    }
}

/// Severity desc, runs desc, evidence desc, confidence desc, title asc.
pub fn compare_tickets(a: &EnrichedTicket, b: &EnrichedTicket) -> Ordering {
    b.ticket
        .severity
        .rank()
        .cmp(&a.ticket.severity.rank())
        .then(b.runs_citing.cmp(&a.runs_citing))
        .then(
            b.ticket
                .evidence_atom_ids
                .len()
                .cmp(&a.ticket.evidence_atom_ids.len()),
        )
        .then(b.ticket.confidence.total_cmp(&a.ticket.confidence))
        .then_with(|| a.ticket.title.to_lowercase().cmp(&b.ticket.title.to_lowercase()))
}

/// Enrich, order and number tickets `BLG-001`, `BLG-002`, ...
pub fn enrich_tickets(tickets: Vec<RawTicket>, catalog: &AtomCatalog, trust: &dyn TrustAssessor) -> Vec<EnrichedTicket> {
    let mut enriched: Vec<EnrichedTicket> = tickets
        .into_iter()
        .map(|t| enrich_ticket(t, catalog, trust))
        .collect();
    enriched.sort_by(compare_tickets);
    for (idx, ticket) in enriched.iter_mut().enumerate() {
        ticket.ticket_id = format!("BLG-{:03}", idx + 1);
    }
    enriched
}
