//! Trait contract tests for AtomLedger.
//!
//! Every backend must pass the same contract; each check runs against the
//! in-memory fake and the YAML file backend.

use std::collections::{BTreeMap, BTreeSet};

use atom_ledger::fakes::MemoryAtomLedger;
use atom_ledger::{
    apply_backlog_observations, AtomLedger, AtomObservation, AtomStatus, LedgerEntry,
    LedgerError, LedgerSnapshot, YamlAtomLedger,
};
use chrono::Utc;

fn backends() -> (tempfile::TempDir, Vec<Box<dyn AtomLedger>>) {
    let dir = tempfile::tempdir().unwrap();
    let yaml = YamlAtomLedger::new(dir.path().join("atoms.yaml"));
    (dir, vec![Box::new(MemoryAtomLedger::new()), Box::new(yaml)])
}

// ===========================================================================
// load / status_of
// ===========================================================================

#[tokio::test]
async fn empty_ledger_loads_empty() {
    let (_dir, ledgers) = backends();
    for ledger in &ledgers {
        assert!(ledger.load().await.unwrap().is_empty());
        assert_eq!(ledger.status_of("missing").await.unwrap(), AtomStatus::New);
    }
}

// ===========================================================================
// promote
// ===========================================================================

#[tokio::test]
async fn promote_creates_missing_entry() {
    let (_dir, ledgers) = backends();
    for ledger in &ledgers {
        let status = ledger.promote("r:s:1", AtomStatus::Ticketed).await.unwrap();
        assert_eq!(status, AtomStatus::Ticketed);
        assert_eq!(ledger.status_of("r:s:1").await.unwrap(), AtomStatus::Ticketed);
    }
}

#[tokio::test]
async fn promote_never_lowers_status() {
    let (_dir, ledgers) = backends();
    for ledger in &ledgers {
        ledger.promote("r:s:1", AtomStatus::Actioned).await.unwrap();
        for lower in [AtomStatus::New, AtomStatus::Ticketed, AtomStatus::Queued] {
            let status = ledger.promote("r:s:1", lower).await.unwrap();
            assert_eq!(status, AtomStatus::Actioned);
        }
    }
}

// ===========================================================================
// update
// ===========================================================================

#[tokio::test]
async fn update_is_all_or_nothing() {
    let (_dir, ledgers) = backends();
    for ledger in &ledgers {
        ledger.promote("keep", AtomStatus::Queued).await.unwrap();

        let err = ledger
            .update(&mut |snapshot: &mut LedgerSnapshot| {
                snapshot.insert("half-written".into(), LedgerEntry::new("half-written"));
                Err(LedgerError::UnsupportedStatus("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnsupportedStatus(_)));

        let snapshot = ledger.load().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["keep"].status, AtomStatus::Queued);
    }
}

#[tokio::test]
async fn backlog_run_is_monotonic_across_runs() {
    let (_dir, ledgers) = backends();
    for ledger in &ledgers {
        let observations = vec![
            AtomObservation {
                atom_id: "r:s:1".into(),
                ..Default::default()
            },
            AtomObservation {
                atom_id: "r:s:2".into(),
                ..Default::default()
            },
        ];
        let mut first_cites = BTreeMap::new();
        first_cites.insert("r:s:1".to_string(), BTreeSet::from(["TKT-a".to_string()]));

        ledger
            .update(&mut |snapshot: &mut LedgerSnapshot| {
                apply_backlog_observations(snapshot, &observations, &first_cites, Utc::now(), None);
                Ok(())
            })
            .await
            .unwrap();

        // Second run cites nothing; r:s:1 must stay ticketed.
        let mut stats = None;
        ledger
            .update(&mut |snapshot: &mut LedgerSnapshot| {
                stats = Some(apply_backlog_observations(
                    snapshot,
                    &observations,
                    &BTreeMap::new(),
                    Utc::now(),
                    None,
                ));
                Ok(())
            })
            .await
            .unwrap();

        let stats = stats.unwrap();
        assert_eq!(stats.created_entries, 0);
        assert_eq!(stats.current_new_atoms, 2);

        let snapshot = ledger.load().await.unwrap();
        assert_eq!(snapshot["r:s:1"].status, AtomStatus::Ticketed);
        assert_eq!(snapshot["r:s:1"].ticket_ids, vec!["TKT-a"]);
        assert_eq!(snapshot["r:s:2"].status, AtomStatus::New);
    }
}

#[tokio::test]
async fn concurrent_promotions_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = std::sync::Arc::new(YamlAtomLedger::new(dir.path().join("atoms.yaml")));

    let mut handles = Vec::new();
    for i in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .promote(&format!("r:s:{i}"), AtomStatus::Ticketed)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(ledger.load().await.unwrap().len(), 8);
}
