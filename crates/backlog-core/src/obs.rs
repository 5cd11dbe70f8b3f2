//! Structured lifecycle events for a mining run.
//!
//! Every event is an `info!` line carrying an `event = "..."` field so log
//! pipelines can filter on it. Non-fatal fallbacks are logged at the call
//! site with `warn!(code = "...")`.

use tracing::info;

/// RAII guard that enters a run-scoped span for synchronous commands.
///
/// Async code should use [`run_span`] with `Instrument` instead; an entered
/// span must not be held across `.await`.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// Span tagged with the run id.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("backlog.run", run_id = %run_id)
}

/// Emit event: mining started.
pub fn emit_mine_started(run_id: &str, atoms: usize, jobs: usize, agent: &str) {
    info!(
        event = "mine.started",
        run_id = %run_id,
        atoms = atoms,
        jobs = jobs,
        agent = %agent,
    );
}

/// Emit event: one miner job finished (fresh, cached or failed).
pub fn emit_miner_finished(tag: &str, pass_type: &str, status: &str, cache: &str, tickets: usize) {
    info!(
        event = "miner.finished",
        tag = %tag,
        pass_type = %pass_type,
        status = %status,
        cache = %cache,
        tickets = tickets,
    );
}

/// Emit event: merge judge verdict for one candidate pair.
pub fn emit_merge_judge_decided(pair_index: usize, same_issue: bool, merged: bool, cache: &str) {
    info!(
        event = "merge_judge.decided",
        pair_index = pair_index,
        same_issue = same_issue,
        merged = merged,
        cache = %cache,
    );
}

/// Emit event: one orphan recovery pass.
pub fn emit_orphan_pass(pass: usize, uncovered_high: usize, sampled: usize, tickets_after: usize) {
    info!(
        event = "orphan.pass",
        pass = pass,
        uncovered_high = uncovered_high,
        sampled = sampled,
        tickets_after = tickets_after,
    );
}

/// Emit event: labeler consensus for one ticket.
pub fn emit_labeler_ticket(fingerprint: &str, variants: usize, disagreement: bool) {
    info!(
        event = "labeler.ticket",
        fingerprint = %fingerprint,
        variants = variants,
        disagreement = disagreement,
    );
}

/// Emit event: mining finished.
pub fn emit_mine_finished(run_id: &str, duration_ms: u64, tickets: usize, miners_failed: usize) {
    info!(
        event = "mine.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        tickets = tickets,
        miners_failed = miners_failed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enter_does_not_panic() {
        let _span = RunSpan::enter("run-test");
        emit_mine_started("run-test", 3, 2, "claude");
        emit_mine_finished("run-test", 10, 1, 0);
    }
}
