//! Process-wide counters for a mining run.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits all of
//! them as one `info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    agent_calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    legacy_cache_hits: AtomicU64,
    repairs: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            agent_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            legacy_cache_hits: AtomicU64::new(0),
            repairs: AtomicU64::new(0),
        }
    }

    pub fn inc_agent_calls(&self) {
        self.agent_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agent_calls", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_misses", "counter incremented");
    }

    pub fn inc_legacy_cache_hits(&self) {
        self.legacy_cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "legacy_cache_hits", "counter incremented");
    }

    pub fn inc_repairs(&self) {
        self.repairs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "repairs", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            agent_calls = self.agent_calls(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            legacy_cache_hits = self.legacy_cache_hits(),
            repairs = self.repairs(),
        );
    }

    pub fn agent_calls(&self) -> u64 {
        self.agent_calls.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn legacy_cache_hits(&self) -> u64 {
        self.legacy_cache_hits.load(Ordering::Relaxed)
    }

    pub fn repairs(&self) -> u64 {
        self.repairs.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.agent_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.legacy_cache_hits.store(0, Ordering::Relaxed);
        self.repairs.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_agent_calls();
        m.inc_agent_calls();
        m.inc_cache_hits();
        m.inc_legacy_cache_hits();
        m.inc_repairs();
        assert_eq!(m.agent_calls(), 2);
        assert_eq!(m.cache_hits(), 1);
        assert_eq!(m.cache_misses(), 0);
        assert_eq!(m.legacy_cache_hits(), 1);
        assert_eq!(m.repairs(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_agent_calls();
        m.inc_cache_misses();
        m.reset();
        assert_eq!(m.agent_calls(), 0);
        assert_eq!(m.cache_misses(), 0);
    }
}
