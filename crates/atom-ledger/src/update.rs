//! Folding one backlog run's observations into the ledger.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::AtomStatus;
use crate::storage_traits::{LedgerEntry, LedgerSnapshot};

/// Prefix of synthetic aggregate atoms, which are regenerated every run and
/// never tracked.
pub const AGGREGATE_PREFIX: &str = "__aggregate__/";

/// True for synthetic aggregate atoms.
pub fn is_aggregate_atom(atom_id: &str, run_rel: Option<&str>) -> bool {
    atom_id.starts_with(AGGREGATE_PREFIX)
        || run_rel.is_some_and(|rel| rel.starts_with(AGGREGATE_PREFIX))
}

/// Provenance of one atom seen in the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtomObservation {
    pub atom_id: String,
    pub source: Option<String>,
    pub severity_hint: Option<String>,
    pub run_rel: Option<String>,
    pub agent: Option<String>,
    pub mission_id: Option<String>,
    pub persona_id: Option<String>,
    pub target_slug: Option<String>,
    pub repo_input: Option<String>,
}

/// Counters reported after a ledger update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUpdateStats {
    pub observed_atoms: usize,
    pub current_new_atoms: usize,
    pub current_ticketed_atoms: usize,
    pub created_entries: usize,
    pub promoted_entries: usize,
    pub ledger_atoms_total: usize,
    pub status_counts: BTreeMap<String, usize>,
}

fn fill(slot: &mut Option<String>, value: &Option<String>) {
    if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        *slot = Some(v.to_string());
    }
}

/// Apply one backlog run to `snapshot`.
///
/// `ticket_ids_by_atom` maps atom ids to the ids of the non-blocked tickets
/// that cite them. Cited atoms desire `ticketed`, every other observed atom
/// desires `new`; the stored status is only ever promoted.
pub fn apply_backlog_observations(
    snapshot: &mut LedgerSnapshot,
    observations: &[AtomObservation],
    ticket_ids_by_atom: &BTreeMap<String, BTreeSet<String>>,
    generated_at: DateTime<Utc>,
    backlog_json: Option<&str>,
) -> LedgerUpdateStats {
    let mut stats = LedgerUpdateStats::default();

    for obs in observations {
        let atom_id = obs.atom_id.trim();
        if atom_id.is_empty() || is_aggregate_atom(atom_id, obs.run_rel.as_deref()) {
            continue;
        }
        stats.observed_atoms += 1;

        let cited = ticket_ids_by_atom.get(atom_id);
        let desired = if cited.is_some() {
            stats.current_ticketed_atoms += 1;
            AtomStatus::Ticketed
        } else {
            stats.current_new_atoms += 1;
            AtomStatus::New
        };

        let entry = snapshot.entry(atom_id.to_string()).or_insert_with(|| {
            stats.created_entries += 1;
            let mut entry = LedgerEntry::new(atom_id);
            entry.first_seen_at = Some(generated_at);
            entry
        });
        if entry.promote(desired) {
            stats.promoted_entries += 1;
        }
        entry.last_backlog_status = Some(desired);
        entry.last_seen_at = Some(generated_at);
        entry.last_backlog_generated_at = Some(generated_at);
        if let Some(path) = backlog_json {
            entry.last_backlog_json = Some(path.to_string());
        }
        fill(&mut entry.source, &obs.source);
        fill(&mut entry.severity_hint, &obs.severity_hint);
        fill(&mut entry.run_rel, &obs.run_rel);
        fill(&mut entry.agent, &obs.agent);
        fill(&mut entry.mission_id, &obs.mission_id);
        fill(&mut entry.persona_id, &obs.persona_id);
        fill(&mut entry.target_slug, &obs.target_slug);
        fill(&mut entry.repo_input, &obs.repo_input);
        if let Some(ids) = cited {
            entry.ticket_ids.extend(ids.iter().cloned());
        }
        entry.normalize();
    }

    stats.ledger_atoms_total = snapshot.len();
    for entry in snapshot.values() {
        *stats
            .status_counts
            .entry(entry.status.as_str().to_string())
            .or_default() += 1;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: &str) -> AtomObservation {
        AtomObservation {
            atom_id: id.to_string(),
            source: Some("confusion_point".into()),
            run_rel: Some("runs/a".into()),
            ..Default::default()
        }
    }

    fn cited(pairs: &[(&str, &str)]) -> BTreeMap<String, BTreeSet<String>> {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (atom, ticket) in pairs {
            map.entry(atom.to_string())
                .or_default()
                .insert(ticket.to_string());
        }
        map
    }

    #[test]
    fn new_and_cited_atoms_get_created() {
        let mut snapshot = LedgerSnapshot::new();
        let now = Utc::now();
        let stats = apply_backlog_observations(
            &mut snapshot,
            &[obs("a:1"), obs("a:2")],
            &cited(&[("a:1", "TKT-1")]),
            now,
            Some("out/backlog.json"),
        );

        assert_eq!(stats.observed_atoms, 2);
        assert_eq!(stats.created_entries, 2);
        assert_eq!(stats.current_ticketed_atoms, 1);
        assert_eq!(stats.current_new_atoms, 1);
        assert_eq!(stats.promoted_entries, 1);
        assert_eq!(snapshot["a:1"].status, AtomStatus::Ticketed);
        assert_eq!(snapshot["a:1"].ticket_ids, vec!["TKT-1"]);
        assert_eq!(snapshot["a:2"].status, AtomStatus::New);
        assert_eq!(snapshot["a:2"].first_seen_at, Some(now));
        assert_eq!(stats.status_counts["ticketed"], 1);
        assert_eq!(stats.status_counts["new"], 1);
    }

    #[test]
    fn status_never_regresses_across_runs() {
        let mut snapshot = LedgerSnapshot::new();
        let mut queued = LedgerEntry::new("a:1");
        queued.status = AtomStatus::Queued;
        snapshot.insert("a:1".into(), queued);

        let stats = apply_backlog_observations(
            &mut snapshot,
            &[obs("a:1")],
            &BTreeMap::new(),
            Utc::now(),
            None,
        );

        assert_eq!(stats.promoted_entries, 0);
        assert_eq!(snapshot["a:1"].status, AtomStatus::Queued);
        assert_eq!(snapshot["a:1"].last_backlog_status, Some(AtomStatus::New));
    }

    #[test]
    fn ticket_ids_accumulate() {
        let mut snapshot = LedgerSnapshot::new();
        apply_backlog_observations(
            &mut snapshot,
            &[obs("a:1")],
            &cited(&[("a:1", "TKT-b")]),
            Utc::now(),
            None,
        );
        apply_backlog_observations(
            &mut snapshot,
            &[obs("a:1")],
            &cited(&[("a:1", "TKT-a"), ("a:1", "TKT-b")]),
            Utc::now(),
            None,
        );
        assert_eq!(snapshot["a:1"].ticket_ids, vec!["TKT-a", "TKT-b"]);
    }

    #[test]
    fn aggregate_atoms_are_skipped() {
        let mut snapshot = LedgerSnapshot::new();
        let stats = apply_backlog_observations(
            &mut snapshot,
            &[obs("__aggregate__/x:1"), obs("a:1")],
            &BTreeMap::new(),
            Utc::now(),
            None,
        );
        assert_eq!(stats.observed_atoms, 1);
        assert!(!snapshot.contains_key("__aggregate__/x:1"));
    }

    #[test]
    fn provenance_keeps_previous_value_when_missing() {
        let mut snapshot = LedgerSnapshot::new();
        apply_backlog_observations(&mut snapshot, &[obs("a:1")], &BTreeMap::new(), Utc::now(), None);
        let bare = AtomObservation {
            atom_id: "a:1".into(),
            ..Default::default()
        };
        apply_backlog_observations(&mut snapshot, &[bare], &BTreeMap::new(), Utc::now(), None);
        assert_eq!(snapshot["a:1"].source.as_deref(), Some("confusion_point"));
        assert_eq!(snapshot["a:1"].run_rel.as_deref(), Some("runs/a"));
    }
}
