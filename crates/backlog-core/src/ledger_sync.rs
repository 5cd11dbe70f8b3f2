//! Bridge between a mining run and the atom lifecycle ledger.

use std::collections::{BTreeMap, BTreeSet};

use atom_ledger::{
    apply_backlog_observations, AtomLedger, AtomObservation, AtomStatus, LedgerSnapshot,
    LedgerUpdateStats,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::backlog::BacklogDocument;
use crate::domain::atom::{Atom, AtomCatalog};
use crate::domain::error::Result;
use crate::domain::ticket::{ticket_fingerprint, Stage};

/// Statuses skipped by default: atoms already turned into work.
pub const DEFAULT_EXCLUDED_STATUSES: [AtomStatus; 3] =
    [AtomStatus::Ticketed, AtomStatus::Queued, AtomStatus::Actioned];

/// What the ledger filter removed, recorded in the document input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerExclusion {
    pub atoms_total: usize,
    pub atoms_kept: usize,
    pub excluded_statuses: Vec<AtomStatus>,
    pub excluded_by_status: BTreeMap<String, usize>,
}

/// Drop atoms whose ledger status is one of `exclude`.
///
/// Atoms absent from the ledger count as `new`.
pub async fn filter_atoms_by_ledger(
    atoms: Vec<Atom>,
    ledger: &dyn AtomLedger,
    exclude: &[AtomStatus],
) -> Result<(Vec<Atom>, LedgerExclusion)> {
    let snapshot = ledger.load().await?;
    let mut exclusion = LedgerExclusion {
        atoms_total: atoms.len(),
        excluded_statuses: exclude.to_vec(),
        ..LedgerExclusion::default()
    };
    let kept: Vec<Atom> = atoms
        .into_iter()
        .filter(|atom| {
            let status = snapshot
                .get(&atom.atom_id)
                .map(|entry| entry.status)
                .unwrap_or_default();
            if exclude.contains(&status) {
                *exclusion
                    .excluded_by_status
                    .entry(status.as_str().to_string())
                    .or_default() += 1;
                false
            } else {
                true
            }
        })
        .collect();
    exclusion.atoms_kept = kept.len();
    Ok((kept, exclusion))
}

/// Ticket ids per atom, for tickets that made it past the stage gate.
pub fn ticket_ids_by_atom(doc: &BacklogDocument) -> BTreeMap<String, BTreeSet<String>> {
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for enriched in &doc.tickets {
        if enriched.ticket.stage() == Stage::Blocked {
            continue;
        }
        let id = format!("TKT-{}", ticket_fingerprint(&enriched.ticket));
        for atom_id in &enriched.ticket.evidence_atom_ids {
            out.entry(atom_id.clone()).or_default().insert(id.clone());
        }
    }
    out
}

/// Fold this run's atoms and tickets into the ledger in one atomic update.
#[instrument(skip_all, fields(atoms = catalog.len()))]
pub async fn update_ledger(
    ledger: &dyn AtomLedger,
    catalog: &AtomCatalog,
    doc: &BacklogDocument,
    generated_at: DateTime<Utc>,
    backlog_json: Option<&str>,
) -> Result<LedgerUpdateStats> {
    let observations: Vec<AtomObservation> = catalog.atoms().iter().map(Atom::observation).collect();
    let cited = ticket_ids_by_atom(doc);
    let mut stats = LedgerUpdateStats::default();
    ledger
        .update(&mut |snapshot: &mut LedgerSnapshot| {
            stats = apply_backlog_observations(snapshot, &observations, &cited, generated_at, backlog_json);
            Ok(())
        })
        .await?;
    info!(
        observed = stats.observed_atoms,
        created = stats.created_entries,
        promoted = stats.promoted_entries,
        "updated atom ledger"
    );
    Ok(stats)
}
