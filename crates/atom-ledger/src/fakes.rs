//! In-memory fakes for the ledger trait (testing only)
//!
//! Provides `MemoryAtomLedger`, which satisfies the `AtomLedger` contract
//! without touching the filesystem.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryAtomLedger
// ---------------------------------------------------------------------------

/// In-memory atom ledger backed by a `BTreeMap<atom_id, entry>`.
#[derive(Debug, Default)]
pub struct MemoryAtomLedger {
    snapshot: Mutex<LedgerSnapshot>,
}

impl MemoryAtomLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the fake with existing entries.
    pub fn with_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        let snapshot = entries
            .into_iter()
            .map(|entry| (entry.atom_id.clone(), entry))
            .collect();
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }
}

#[async_trait]
impl AtomLedger for MemoryAtomLedger {
    async fn load(&self) -> LedgerResult<LedgerSnapshot> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn update(
        &self,
        mutate: &mut (dyn for<'s> FnMut(&'s mut LedgerSnapshot) -> LedgerResult<()> + Send),
    ) -> LedgerResult<()> {
        let mut guard = self.snapshot.lock().await;
        // Work on a copy so a failing mutation leaves the stored state intact.
        let mut working = guard.clone();
        mutate(&mut working)?;
        for entry in working.values_mut() {
            entry.normalize();
        }
        *guard = working;
        Ok(())
    }
}
