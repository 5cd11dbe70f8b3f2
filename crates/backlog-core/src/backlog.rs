//! The backlog document: coverage statistics, totals, the ordered ticket
//! list and its Markdown rendering.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use atom_ledger::LedgerUpdateStats;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use triage_engine::TrustAssessor;

use crate::cache::fs::{write_json_pretty, write_text};
use crate::domain::atom::{Atom, AtomCatalog};
use crate::domain::error::Result;
use crate::domain::ticket::RawTicket;
use crate::enrich::{enrich_tickets, AtomPreview, EnrichedTicket};
use crate::labeler::LabelerMeta;
use crate::miner::MinersMeta;

pub const DEFAULT_TITLE: &str = "Usertest Backlog";
pub const COVERAGE_PREVIEW_LIMIT: usize = 25;
const MARKDOWN_LIST_LIMIT: usize = 6;
const UNTRIAGED_TAIL_LIMIT: usize = 40;

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub covered_atoms: usize,
    pub uncovered_atoms: usize,
    pub coverage_ratio: f64,
    pub uncovered_high_severity_atoms: usize,
    pub uncovered_high_severity_atom_ids: Vec<String>,
    pub uncovered_high_severity_atoms_preview: Vec<AtomPreview>,
    pub uncovered_preview: Vec<AtomPreview>,
}

/// How much of `atoms` the tickets' evidence covers.
///
/// Evidence ids that name no atom are ignored. The ratio is 1.0 when there
/// are no atoms.
pub fn compute_coverage<'a, T>(atoms: &[Atom], tickets: T, preview_limit: usize) -> Coverage
where
    T: IntoIterator<Item = &'a RawTicket>,
{
    let valid: BTreeSet<&str> = atoms.iter().map(|a| a.atom_id.as_str()).collect();
    let covered: BTreeSet<&str> = tickets
        .into_iter()
        .flat_map(|t| t.evidence_atom_ids.iter())
        .map(String::as_str)
        .filter(|id| valid.contains(id))
        .collect();

    let uncovered: Vec<&Atom> = atoms
        .iter()
        .filter(|a| !covered.contains(a.atom_id.as_str()))
        .collect();
    let uncovered_high: Vec<&Atom> = uncovered
        .iter()
        .copied()
        .filter(|a| a.severity_hint.is_high())
        .collect();

    Coverage {
        covered_atoms: covered.len(),
        uncovered_atoms: uncovered.len(),
        coverage_ratio: if valid.is_empty() {
            1.0
        } else {
            covered.len() as f64 / valid.len() as f64
        },
        uncovered_high_severity_atoms: uncovered_high.len(),
        uncovered_high_severity_atom_ids: uncovered_high.iter().map(|a| a.atom_id.clone()).collect(),
        uncovered_high_severity_atoms_preview: uncovered_high
            .iter()
            .take(preview_limit)
            .map(|a| AtomPreview::of(a))
            .collect(),
        uncovered_preview: uncovered
            .iter()
            .take(preview_limit)
            .map(|a| AtomPreview::of(a))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub runs: usize,
    pub atoms: usize,
    pub tickets: usize,
    pub source_counts: BTreeMap<String, usize>,
    pub severity_hint_counts: BTreeMap<String, usize>,
    pub miners_total: usize,
    pub miners_completed: usize,
    pub miners_failed: usize,
    pub merge_decisions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogDocument {
    pub generated_at_utc: String,
    pub input: Value,
    pub totals: Totals,
    pub tickets: Vec<EnrichedTicket>,
    pub coverage: Coverage,
    pub miners_meta: MinersMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labelers_meta: Option<LabelerMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<LedgerUpdateStats>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

/// Inputs to [`build_backlog_document`] beyond atoms and tickets.
#[derive(Debug, Clone)]
pub struct DocumentParts {
    pub generated_at: DateTime<Utc>,
    pub input: Value,
    pub miners_meta: MinersMeta,
    pub labelers_meta: Option<LabelerMeta>,
    pub artifacts: BTreeMap<String, String>,
}

/// Distinct non-aggregate runs among `atoms`.
pub fn count_runs(atoms: &[Atom]) -> usize {
    atoms
        .iter()
        .filter(|a| !a.is_aggregate())
        .filter_map(|a| a.run_rel.as_deref())
        .filter(|r| !r.is_empty())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Enrich and order tickets, then assemble the document around them.
pub fn build_backlog_document(
    catalog: &AtomCatalog,
    tickets: Vec<RawTicket>,
    trust: &dyn TrustAssessor,
    parts: DocumentParts,
) -> BacklogDocument {
    let atoms = catalog.atoms();
    let ordered = enrich_tickets(tickets, catalog, trust);
    let coverage = compute_coverage(atoms, ordered.iter().map(|t| &t.ticket), COVERAGE_PREVIEW_LIMIT);

    let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut severity_hint_counts: BTreeMap<String, usize> = BTreeMap::new();
    for atom in atoms {
        *source_counts.entry(atom.source.clone()).or_default() += 1;
        *severity_hint_counts
            .entry(atom.severity_hint.as_str().to_string())
            .or_default() += 1;
    }

    let miners = &parts.miners_meta;
    let totals = Totals {
        runs: count_runs(atoms),
        atoms: atoms.len(),
        tickets: ordered.len(),
        source_counts,
        severity_hint_counts,
        miners_total: miners.miners_total,
        miners_completed: miners.miners_completed,
        miners_failed: miners.miners_failed,
        merge_decisions: miners.merge_decisions,
    };

    BacklogDocument {
        generated_at_utc: parts.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        input: parts.input,
        totals,
        tickets: ordered,
        coverage,
        miners_meta: parts.miners_meta,
        labelers_meta: parts.labelers_meta,
        ledger: None,
        artifacts: parts.artifacts,
    }
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

fn render_ticket(out: &mut String, ticket: &EnrichedTicket) {
    let t = &ticket.ticket;
    let _ = writeln!(out, "### {}: {}", ticket.ticket_id, t.title);
    let _ = writeln!(
        out,
        "- Severity: `{}` | Confidence: `{:.2}` | Runs citing: `{}`",
        t.severity.as_str(),
        t.confidence,
        ticket.runs_citing
    );
    let _ = writeln!(out, "- Trust: `{}` ({:.2})", ticket.trust.level, ticket.trust.score);
    let _ = writeln!(out, "- Stage: `{}`", t.stage());

    let surface = t.change_surface.clone().unwrap_or_default();
    let kinds: Vec<String> = surface.kinds.iter().map(|k| format!("`{}`", k.as_str())).collect();
    let _ = writeln!(
        out,
        "- Change surface: user_visible=`{}`; kinds={}",
        surface.user_visible,
        kinds.join(", ")
    );
    if !surface.notes.trim().is_empty() {
        let _ = writeln!(out, "- Change surface notes: {}", surface.notes);
    }

    let b = &ticket.breadth;
    let _ = writeln!(
        out,
        "- Breadth: missions=`{}`, targets=`{}`, repo_inputs=`{}`, agents=`{}`, personas=`{}`",
        b.missions, b.targets, b.repo_inputs, b.agents, b.personas
    );
    if !t.risks.is_empty() {
        let risks: Vec<String> = t.risks.iter().map(|r| format!("`{r}`")).collect();
        let _ = writeln!(out, "- Risks: {}", risks.join(", "));
    }

    for (label, value) in [
        ("Problem", t.problem.as_str()),
        ("User impact", t.user_impact.as_str()),
        ("Proposed fix", t.proposed_fix.as_deref().unwrap_or_default()),
    ] {
        if !value.trim().is_empty() {
            let _ = writeln!(out, "- {label}: {value}");
        }
    }

    for (label, items) in [
        ("Investigation steps", &t.investigation_steps),
        ("Success criteria", &t.success_criteria),
    ] {
        if items.is_empty() {
            continue;
        }
        let _ = writeln!(out, "- {label}:");
        for item in items.iter().take(MARKDOWN_LIST_LIMIT) {
            let _ = writeln!(out, "  - {item}");
        }
    }

    if !ticket.evidence_atoms_preview.is_empty() {
        let _ = writeln!(out, "- Evidence preview:");
        for atom in ticket.evidence_atoms_preview.iter().take(MARKDOWN_LIST_LIMIT) {
            let _ = writeln!(
                out,
                "  - `{}` from `{}` (`{}`): {}",
                atom.atom_id,
                atom.run_rel.as_deref().unwrap_or("unknown"),
                atom.source,
                atom.text
            );
        }
    }
    out.push('\n');
}

/// Human-readable rendering of a backlog document.
pub fn render_markdown(doc: &BacklogDocument, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {title}\n");
    let _ = writeln!(out, "Generated: `{}`\n", doc.generated_at_utc);

    let _ = writeln!(out, "## Summary");
    let _ = writeln!(out, "- Runs: **{}**", doc.totals.runs);
    let _ = writeln!(out, "- Atoms: **{}**", doc.totals.atoms);
    let _ = writeln!(out, "- Tickets: **{}**", doc.totals.tickets);
    let _ = writeln!(
        out,
        "- Coverage: covered=**{}**, uncovered=**{}**\n",
        doc.coverage.covered_atoms, doc.coverage.uncovered_atoms
    );

    let _ = writeln!(out, "## Tickets");
    if doc.tickets.is_empty() {
        let _ = writeln!(out, "- No backlog tickets were produced.\n");
    }
    for ticket in &doc.tickets {
        render_ticket(&mut out, ticket);
    }

    let _ = writeln!(out, "## Untriaged Tail\n");
    if doc.coverage.uncovered_preview.is_empty() {
        let _ = writeln!(out, "- No uncovered atoms.");
    }
    for atom in doc.coverage.uncovered_preview.iter().take(UNTRIAGED_TAIL_LIMIT) {
        let _ = writeln!(
            out,
            "- `{}` (`{}` / `{}` / severity `{}`): {}",
            atom.atom_id,
            atom.run_rel.as_deref().unwrap_or("unknown"),
            atom.source,
            atom.severity_hint.as_str(),
            atom.text
        );
    }
    out
}

/// Write the JSON document and, when asked, its Markdown rendering.
pub fn write_backlog(doc: &BacklogDocument, json_path: &Path, md_path: Option<&Path>, title: &str) -> Result<()> {
    write_json_pretty(json_path, doc)?;
    if let Some(md_path) = md_path {
        write_text(md_path, &render_markdown(doc, title))?;
    }
    info!(
        json = %json_path.display(),
        tickets = doc.tickets.len(),
        "wrote backlog"
    );
    Ok(())
}
