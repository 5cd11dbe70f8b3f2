//! Shared fixtures for the mining integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use backlog_core::fakes::ScriptedAdapter;
use backlog_core::{Atom, MiningConfig, MiningContext, PromptManifest, Severity};
use serde_json::{json, Value};

pub const LABEL_DOCS: &str = r#"{"change_surface":{"user_visible":true,"kinds":["docs_change"]},"component":"docs","intent_risk":"low","confidence":0.8}"#;
pub const NOT_SAME_ISSUE: &str = r#"{"same_issue": false}"#;

pub fn manifest() -> PromptManifest {
    let mut templates = BTreeMap::new();
    for name in ["cov.md", "bag.md", "orphan.md"] {
        templates.insert(name.to_string(), format!("{name}\n{{{{ATOMS_JSON}}}}"));
    }
    templates.insert(
        "merge.md".to_string(),
        "merge.md\n{{LEFT_TICKET_JSON}}\n{{RIGHT_TICKET_JSON}}".to_string(),
    );
    templates.insert(
        "label.md".to_string(),
        "label.md {{LABELER_VARIANT}}\n{{TICKET_JSON}}".to_string(),
    );
    PromptManifest::from_parts(
        "prompts",
        vec!["cov.md".into()],
        vec!["bag.md".into()],
        "orphan.md",
        "merge.md",
        "label.md",
        templates,
    )
    .unwrap()
}

/// Four runs, two agents, distinct vocabulary per atom.
pub fn atoms() -> Vec<Atom> {
    vec![
        Atom::new("r1:failure:1", "runs/r1", "run_failure_event", "sandbox crashed while mounting volume")
            .with_severity(Severity::High)
            .with_agent("claude"),
        Atom::new("r2:confusion:1", "runs/r2", "confusion_point", "readme never explains config precedence")
            .with_agent("codex"),
        Atom::new("r3:suggestion:1", "runs/r3", "suggested_change", "add a flag to skip telemetry upload")
            .with_agent("claude"),
        Atom::new("r4:stderr:1", "runs/r4", "agent_stderr_artifact", "permission denied writing cache directory")
            .with_severity(Severity::High)
            .with_agent("codex"),
    ]
}

/// Atom ids embedded in a rendered miner prompt.
pub fn prompt_atom_ids(prompt: &str) -> Vec<(String, String)> {
    let body = prompt.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    parsed["atoms"]
        .as_array()
        .map(|atoms| {
            atoms
                .iter()
                .map(|a| {
                    (
                        a["atom_id"].as_str().unwrap_or_default().to_string(),
                        a["text"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One ticket per atom in the prompt, titled after the atom text.
pub fn tickets_for_prompt(prompt: &str) -> String {
    let tickets: Vec<Value> = prompt_atom_ids(prompt)
        .into_iter()
        .map(|(id, text)| {
            json!({
                "title": format!("Fix: {text}"),
                "severity": "high",
                "confidence": 0.7,
                "evidence_atom_ids": [id],
                "proposed_fix": "investigate and fix",
                "success_criteria": ["no longer reproduces"],
            })
        })
        .collect();
    Value::Array(tickets).to_string()
}

/// Answer every prompt kind the pipeline sends.
pub fn routed_response(prompt: &str) -> String {
    if prompt.starts_with("label.md") {
        LABEL_DOCS.to_string()
    } else if prompt.starts_with("merge.md") {
        NOT_SAME_ISSUE.to_string()
    } else {
        tickets_for_prompt(prompt)
    }
}

pub fn routed_adapter() -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(|req| Ok(routed_response(&req.prompt))))
}

pub fn config() -> MiningConfig {
    MiningConfig {
        miners: 3,
        coverage_miners: 2,
        sample_size: 0,
        labelers: 0,
        orphan_passes: 0,
        merge_enabled: false,
        ..MiningConfig::default()
    }
}

/// Context over the filesystem store rooted at `dir`.
pub fn context(adapter: Arc<ScriptedAdapter>, atoms: Vec<Atom>, dir: &Path, config: MiningConfig) -> Arc<MiningContext> {
    Arc::new(MiningContext::new(adapter, manifest(), atoms, dir, config).unwrap())
}

pub fn anchors(doc: &backlog_core::BacklogDocument) -> Vec<(String, Vec<String>)> {
    doc.tickets
        .iter()
        .map(|t| (t.ticket.title.clone(), t.ticket.evidence_atom_ids.clone()))
        .collect()
}
