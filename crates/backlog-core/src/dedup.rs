//! First-pass ticket dedup: cluster near-duplicates and fold each cluster
//! with the deterministic merge rule.

use triage_engine::{dedupe_clusters, DedupeThresholds, Embedder, SimilarityWeights, TriageInput};
use tracing::{debug, warn};

use crate::domain::ticket::{merge_two_tickets, RawTicket};

pub use crate::domain::ticket::dedupe_by_anchor;

/// Text the similarity engine sees for one ticket.
pub fn triage_input(ticket: &RawTicket) -> TriageInput {
    let mut chunks = vec![
        ticket.title.clone(),
        ticket.problem.clone(),
        ticket.user_impact.clone(),
        ticket.proposed_fix.clone().unwrap_or_default(),
        ticket.suggested_owner.clone().unwrap_or_default(),
    ];
    if let Some(cs) = &ticket.change_surface {
        chunks.extend(cs.kinds.iter().map(|k| k.as_str().to_string()));
        chunks.push(cs.notes.clone());
    }
    chunks.extend(ticket.investigation_steps.iter().cloned());
    chunks.extend(ticket.success_criteria.iter().cloned());
    chunks.retain(|c| !c.trim().is_empty());

    TriageInput {
        title: ticket.title.clone(),
        chunks,
        evidence_ids: ticket.evidence_atom_ids.clone(),
    }
}

/// Collapse clusters of duplicate tickets into one ticket each.
///
/// Cluster order follows first appearance. If the similarity engine fails
/// the input comes back unchanged.
pub fn dedupe_tickets(
    tickets: Vec<RawTicket>,
    embedder: &dyn Embedder,
    weights: &SimilarityWeights,
    thresholds: &DedupeThresholds,
) -> Vec<RawTicket> {
    if tickets.len() < 2 {
        return tickets;
    }
    let inputs: Vec<TriageInput> = tickets.iter().map(triage_input).collect();
    let clusters = match dedupe_clusters(&inputs, embedder, weights, thresholds) {
        Ok(clusters) => clusters,
        Err(e) => {
            warn!(code = "dedupe_failed", error = %e, "similarity clustering failed; keeping tickets as-is");
            return tickets;
        }
    };

    let mut out = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let Some((&first, rest)) = cluster.split_first() else {
            continue;
        };
        let mut base = tickets[first].clone();
        base.merged_count = base.merged_count.max(1);
        for &idx in rest {
            base = merge_two_tickets(&base, &tickets[idx]);
        }
        out.push(base);
    }
    debug!(before = tickets.len(), after = out.len(), "deduped tickets");
    out
}
