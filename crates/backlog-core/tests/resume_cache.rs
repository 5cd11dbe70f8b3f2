//! Resume behavior across invocations sharing one artifacts directory.

mod common;

use backlog_core::fakes::ScriptedAdapter;
use backlog_core::{mine_backlog, plan_jobs, Atom, CacheStatus, MiningConfig, UnitStatus};
use common::{anchors, atoms, config, context, routed_adapter};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn second_run_makes_no_agent_calls() {
    let dir = tempfile::tempdir().unwrap();
    let full = MiningConfig {
        labelers: 3,
        orphan_passes: 1,
        merge_enabled: true,
        ..config()
    };

    let first_adapter = routed_adapter();
    let first = mine_backlog(
        context(first_adapter.clone(), atoms(), dir.path(), full.clone()),
        json!({}),
    )
    .await
    .unwrap();
    assert!(first_adapter.calls() > 0);
    assert!(!first.tickets.is_empty());

    let second_adapter = routed_adapter();
    let second = mine_backlog(context(second_adapter.clone(), atoms(), dir.path(), full), json!({}))
        .await
        .unwrap();
    assert_eq!(second_adapter.calls(), 0);
    assert_eq!(anchors(&first), anchors(&second));
    assert!(second
        .miners_meta
        .jobs
        .iter()
        .all(|job| job.cache == CacheStatus::Verified));
    let labels = second.labelers_meta.unwrap();
    assert_eq!(labels.labeler_runs, 0);
    assert_eq!(labels.cached_runs, first.tickets.len() * 3);
}

#[tokio::test]
async fn changed_atom_text_reruns_only_jobs_that_saw_it() {
    let dir = tempfile::tempdir().unwrap();
    mine_backlog(context(routed_adapter(), atoms(), dir.path(), config()), json!({}))
        .await
        .unwrap();

    let mut edited = atoms();
    edited[1].text = "readme contradicts itself about config precedence".to_string();
    let adapter = routed_adapter();
    let ctx = context(adapter.clone(), edited, dir.path(), config());
    let touched: Vec<String> = plan_jobs(&ctx)
        .unwrap()
        .into_iter()
        .filter(|job| job.atoms.iter().any(|a| a.atom_id == "r2:confusion:1"))
        .map(|job| job.tag)
        .collect();
    // One coverage chunk plus the bagging job over every atom.
    assert_eq!(touched.len(), 2);

    let doc = mine_backlog(ctx, json!({})).await.unwrap();
    assert_eq!(adapter.calls(), touched.len());
    for job in &doc.miners_meta.jobs {
        let expected = if touched.contains(&job.tag) {
            CacheStatus::Miss
        } else {
            CacheStatus::Verified
        };
        assert_eq!(job.cache, expected, "job {}", job.tag);
    }
}

#[tokio::test]
async fn force_ignores_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    mine_backlog(context(routed_adapter(), atoms(), dir.path(), config()), json!({}))
        .await
        .unwrap();

    let adapter = routed_adapter();
    let forced = MiningConfig {
        force: true,
        ..config()
    };
    mine_backlog(context(adapter.clone(), atoms(), dir.path(), forced), json!({}))
        .await
        .unwrap();
    assert_eq!(adapter.calls(), 3);
}

#[tokio::test]
async fn output_without_manifest_is_reused_as_legacy_unless_strict() {
    let dir = tempfile::tempdir().unwrap();
    mine_backlog(context(routed_adapter(), atoms(), dir.path(), config()), json!({}))
        .await
        .unwrap();
    let manifest_path = dir.path().join("miners/miner_001/input_manifest.json");
    std::fs::remove_file(&manifest_path).unwrap();

    // Legacy outputs are accepted by default.
    let adapter = routed_adapter();
    let doc = mine_backlog(context(adapter.clone(), atoms(), dir.path(), config()), json!({}))
        .await
        .unwrap();
    assert_eq!(adapter.calls(), 0);
    let job = doc.miners_meta.jobs.iter().find(|j| j.tag == "miner_001").unwrap();
    assert_eq!(job.cache, CacheStatus::Legacy);
    // Backfilled, so the next run sees a verified hit.
    assert!(manifest_path.is_file());

    std::fs::remove_file(&manifest_path).unwrap();
    let strict_config = MiningConfig {
        accept_legacy_cache: false,
        ..config()
    };
    let strict = routed_adapter();
    let doc = mine_backlog(context(strict.clone(), atoms(), dir.path(), strict_config), json!({}))
        .await
        .unwrap();
    assert_eq!(strict.calls(), 1);
    let job = doc.miners_meta.jobs.iter().find(|j| j.tag == "miner_001").unwrap();
    assert_eq!(job.cache, CacheStatus::Miss);
}

#[tokio::test]
async fn dry_run_writes_prompts_and_no_manifests() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = routed_adapter();
    let dry = MiningConfig {
        dry_run: true,
        ..config()
    };
    let doc = mine_backlog(context(adapter.clone(), atoms(), dir.path(), dry), json!({}))
        .await
        .unwrap();
    assert_eq!(adapter.calls(), 0);
    assert!(doc.tickets.is_empty());
    assert_eq!(doc.miners_meta.miners_completed, 3);
    assert!(doc.miners_meta.jobs.iter().all(|j| j.status == UnitStatus::DryRun));
    let job_dir = dir.path().join("miners/miner_001");
    assert!(job_dir.join("dry_run.prompt.txt").is_file());
    assert!(!job_dir.join("input_manifest.json").exists());

    // A later real run is not fooled by the dry run.
    let real = routed_adapter();
    mine_backlog(context(real.clone(), atoms(), dir.path(), config()), json!({}))
        .await
        .unwrap();
    assert_eq!(real.calls(), 3);
}

#[tokio::test]
async fn parse_failures_are_retried_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let garbage = Arc::new(ScriptedAdapter::constant("I could not find anything useful."));
    let doc = mine_backlog(context(garbage.clone(), atoms(), dir.path(), config()), json!({}))
        .await
        .unwrap();
    // Each job: first answer plus one repair attempt.
    assert_eq!(garbage.calls(), 6);
    assert_eq!(doc.miners_meta.miners_failed, 3);
    assert!(dir.path().join("miners/miner_001/parse_error.txt").is_file());

    let adapter = routed_adapter();
    let doc = mine_backlog(context(adapter.clone(), atoms(), dir.path(), config()), json!({}))
        .await
        .unwrap();
    assert_eq!(adapter.calls(), 3);
    assert_eq!(doc.miners_meta.miners_failed, 0);
    assert!(!dir.path().join("miners/miner_001/parse_error.txt").exists());
}

#[test]
fn atoms_fixture_has_distinct_runs() {
    let runs: std::collections::BTreeSet<String> = atoms().iter().map(|a: &Atom| a.run_key().to_string()).collect();
    assert_eq!(runs.len(), 4);
}
