//! Evidence atoms: the immutable input of a mining run.
//!
//! Atoms are produced upstream (one per failure, confusion point,
//! suggestion, ...) and only ever filtered here. Fields this crate does not
//! model are kept in `extra` and passed through to prompts untouched.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use atom_ledger::{is_aggregate_atom, AtomObservation};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::domain::error::{BacklogError, Result};

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity shared by atom hints and tickets.
///
/// Unknown or missing values read as `medium`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Blocker,
}

impl Severity {
    pub fn rank(self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Blocker => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Blocker => "blocker",
        }
    }

    /// Lenient parse: trims, ignores case, falls back to `medium`.
    pub fn parse_lenient(raw: &str) -> Severity {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "high" => Severity::High,
            "blocker" => Severity::Blocker,
            _ => Severity::Medium,
        }
    }

    /// `high` and `blocker`.
    pub fn is_high(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Severity::parse_lenient).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// SourceKind
// ---------------------------------------------------------------------------

/// Where an atom was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    CommandFailure,
    RunFailureEvent,
    ErrorJson,
    ReportValidationError,
    ConfusionPoint,
    SuggestedChange,
    ConfidenceMissing,
    CapabilityWarning,
    CapabilityWarningArtifact,
    CapabilityNoticeArtifact,
    AgentStderr,
    AgentStderrArtifact,
    AgentLastMessageArtifact,
    #[serde(other)]
    Other,
}

impl SourceKind {
    pub fn parse(raw: &str) -> SourceKind {
        serde_json::from_value(Value::String(raw.trim().to_string())).unwrap_or(SourceKind::Other)
    }
}

// ---------------------------------------------------------------------------
// Atom
// ---------------------------------------------------------------------------

/// Extra upstream fields forwarded to miner prompts when present.
const PROMPT_EXTRA_FIELDS: &[&str] = &[
    "failure_kind",
    "error",
    "report_validation_errors",
    "artifacts",
    "attachments",
    "impact",
    "evidence",
    "type",
    "location",
    "priority",
    "expected_impact",
    "report_kind",
    "report_block",
    "report_issue_block",
    "report_ux_block",
    "issue_severity",
    "issue_title",
    "evidence_text",
];

/// Extra fields forwarded to labeler prompts when present.
const LABELER_EXTRA_FIELDS: &[&str] = &[
    "failure_kind",
    "error",
    "report_validation_errors",
    "artifacts",
    "attachments",
];

/// One unit of extracted evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub atom_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_rel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_utc: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub severity_hint: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_score_hint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_anchors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_atom_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Atom {
    /// Minimal atom, mostly for tests and fixtures.
    pub fn new(
        atom_id: impl Into<String>,
        run_rel: impl Into<String>,
        source: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            atom_id: atom_id.into(),
            run_id: None,
            run_rel: Some(run_rel.into()),
            agent: None,
            status: None,
            timestamp_utc: None,
            source: source.into(),
            text: text.into(),
            severity_hint: Severity::Medium,
            severity_score_hint: None,
            target_slug: None,
            repo_input: None,
            mission_id: None,
            persona_id: None,
            path_anchors: Vec::new(),
            linked_atom_ids: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity_hint = severity;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn source_kind(&self) -> SourceKind {
        SourceKind::parse(&self.source)
    }

    /// Run grouping key used by the per-run sampling cap.
    pub fn run_key(&self) -> &str {
        non_empty(&self.run_rel).unwrap_or("unknown")
    }

    /// Synthetic aggregate atoms are regenerated every run.
    pub fn is_aggregate(&self) -> bool {
        is_aggregate_atom(&self.atom_id, self.run_rel.as_deref())
    }

    /// Fields handed to miner prompts.
    pub fn prompt_payload(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("atom_id".into(), Value::String(self.atom_id.clone()));
        obj.insert("run_rel".into(), opt_value(&self.run_rel));
        obj.insert("agent".into(), opt_value(&self.agent));
        obj.insert("status".into(), opt_value(&self.status));
        obj.insert("source".into(), Value::String(self.source.clone()));
        obj.insert(
            "severity_hint".into(),
            Value::String(self.severity_hint.as_str().into()),
        );
        obj.insert("text".into(), Value::String(self.text.clone()));
        self.copy_extras(&mut obj, PROMPT_EXTRA_FIELDS);
        if !self.path_anchors.is_empty() {
            obj.insert("path_anchors".into(), string_list(&self.path_anchors));
        }
        if !self.linked_atom_ids.is_empty() {
            obj.insert("linked_atom_ids".into(), string_list(&self.linked_atom_ids));
        }
        Value::Object(obj)
    }

    /// Fields handed to labeler prompts.
    pub fn labeler_payload(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("atom_id".into(), Value::String(self.atom_id.clone()));
        obj.insert("run_rel".into(), opt_value(&self.run_rel));
        obj.insert("target_slug".into(), opt_value(&self.target_slug));
        obj.insert("repo_input".into(), opt_value(&self.repo_input));
        obj.insert("mission_id".into(), opt_value(&self.mission_id));
        obj.insert("persona_id".into(), opt_value(&self.persona_id));
        obj.insert("agent".into(), opt_value(&self.agent));
        obj.insert("source".into(), Value::String(self.source.clone()));
        obj.insert(
            "severity_hint".into(),
            Value::String(self.severity_hint.as_str().into()),
        );
        obj.insert("text".into(), Value::String(self.text.clone()));
        self.copy_extras(&mut obj, LABELER_EXTRA_FIELDS);
        Value::Object(obj)
    }

    /// Provenance recorded in the lifecycle ledger.
    pub fn observation(&self) -> AtomObservation {
        AtomObservation {
            atom_id: self.atom_id.clone(),
            source: Some(self.source.clone()).filter(|s| !s.trim().is_empty()),
            severity_hint: Some(self.severity_hint.as_str().to_string()),
            run_rel: self.run_rel.clone(),
            agent: self.agent.clone(),
            mission_id: self.mission_id.clone(),
            persona_id: self.persona_id.clone(),
            target_slug: self.target_slug.clone(),
            repo_input: self.repo_input.clone(),
        }
    }

    fn copy_extras(&self, obj: &mut serde_json::Map<String, Value>, fields: &[&str]) {
        for field in fields {
            if let Some(value) = self.extra.get(*field).filter(|v| !v.is_null()) {
                obj.insert((*field).to_string(), value.clone());
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn opt_value(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

fn string_list(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read atoms from a JSONL file (one atom per line) or a JSON document
/// shaped `{"atoms": [...]}`.
///
/// Malformed input is a configuration error naming the offending line.
pub fn read_atoms(path: &Path) -> Result<Vec<Atom>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        BacklogError::config(format!("cannot read atoms file {}: {e}", path.display()))
    })?;
    parse_atoms(&text).map_err(|e| match e {
        BacklogError::Configuration(msg) => {
            BacklogError::config(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Parse atoms from JSONL or `{"atoms": [...]}` text.
pub fn parse_atoms(text: &str) -> Result<Vec<Atom>> {
    if let Ok(Value::Object(mut doc)) = serde_json::from_str::<Value>(text) {
        if let Some(Value::Array(items)) = doc.remove("atoms") {
            return items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| {
                    let atom: Atom = serde_json::from_value(item).map_err(|e| {
                        BacklogError::config(format!("atoms[{idx}] is not a valid atom: {e}"))
                    })?;
                    validate_atom(atom, &format!("atoms[{idx}]"))
                })
                .collect();
        }
    }

    let mut atoms = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let atom: Atom = serde_json::from_str(line).map_err(|e| {
            BacklogError::config(format!("line {} is not a valid atom: {e}", idx + 1))
        })?;
        atoms.push(validate_atom(atom, &format!("line {}", idx + 1))?);
    }
    Ok(atoms)
}

fn validate_atom(mut atom: Atom, location: &str) -> Result<Atom> {
    atom.atom_id = atom.atom_id.trim().to_string();
    if atom.atom_id.is_empty() {
        return Err(BacklogError::config(format!("{location} has an empty atom_id")));
    }
    Ok(atom)
}

// ---------------------------------------------------------------------------
// AtomCatalog
// ---------------------------------------------------------------------------

/// Ordered atoms plus an id index.
#[derive(Debug, Clone, Default)]
pub struct AtomCatalog {
    atoms: Vec<Atom>,
    index: HashMap<String, usize>,
}

impl AtomCatalog {
    /// Build a catalog; later duplicates of an id are dropped with a warning.
    pub fn new(atoms: Vec<Atom>) -> Self {
        let mut kept = Vec::with_capacity(atoms.len());
        let mut index = HashMap::with_capacity(atoms.len());
        for atom in atoms {
            if index.contains_key(&atom.atom_id) {
                warn!(code = "duplicate_atom_id", atom_id = %atom.atom_id, "dropping duplicate atom");
                continue;
            }
            index.insert(atom.atom_id.clone(), kept.len());
            kept.push(atom);
        }
        Self { atoms: kept, index }
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn get(&self, atom_id: &str) -> Option<&Atom> {
        self.index.get(atom_id).map(|&idx| &self.atoms[idx])
    }

    pub fn contains(&self, atom_id: &str) -> bool {
        self.index.contains_key(atom_id)
    }

    /// Resolve `evidence_ids` in order under a count and character budget.
    ///
    /// Unknown ids are skipped. Selection stops at `max_atoms`, or when the
    /// next atom would exceed `max_chars` and at least one atom is already
    /// selected. A zero cap disables that bound.
    pub fn select_evidence(
        &self,
        evidence_ids: &[String],
        max_atoms: usize,
        max_chars: usize,
    ) -> (Vec<&Atom>, Vec<String>) {
        let mut atoms = Vec::new();
        let mut ids = Vec::new();
        let mut total_chars = 0usize;
        for atom_id in evidence_ids {
            let Some(atom) = self.get(atom_id) else {
                continue;
            };
            let chars = atom.text.chars().count();
            if max_atoms > 0 && atoms.len() >= max_atoms {
                break;
            }
            if max_chars > 0 && !atoms.is_empty() && total_chars + chars > max_chars {
                break;
            }
            atoms.push(atom);
            ids.push(atom_id.clone());
            total_chars += chars;
        }
        (atoms, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parse_is_lenient() {
        assert_eq!(Severity::parse_lenient(" HIGH "), Severity::High);
        assert_eq!(Severity::parse_lenient("blocker"), Severity::Blocker);
        assert_eq!(Severity::parse_lenient("critical"), Severity::Medium);
        assert_eq!(Severity::parse_lenient(""), Severity::Medium);
        assert!(Severity::Blocker.rank() > Severity::High.rank());
        assert!(Severity::High.is_high() && !Severity::Medium.is_high());
    }

    #[test]
    fn source_kind_falls_back_to_other() {
        assert_eq!(SourceKind::parse("run_failure_event"), SourceKind::RunFailureEvent);
        assert_eq!(SourceKind::parse("agent_stderr_artifact"), SourceKind::AgentStderrArtifact);
        assert_eq!(SourceKind::parse("something_new"), SourceKind::Other);
    }

    #[test]
    fn parse_jsonl_skips_blank_lines_and_keeps_extras() {
        let text = concat!(
            r#"{"atom_id":"r1:run_failure_event:1","run_rel":"r1","source":"run_failure_event","text":"boom","severity_hint":"high","failure_kind":"timeout"}"#,
            "\n\n",
            r#"{"atom_id":"r2:confusion_point:1","run_rel":"r2","source":"confusion_point","text":"huh","severity_hint":"weird"}"#,
            "\n"
        );
        let atoms = parse_atoms(text).unwrap();
        assert_eq!(atoms.len(), 2);
        assert_eq!(atoms[0].severity_hint, Severity::High);
        assert_eq!(atoms[0].extra["failure_kind"], "timeout");
        assert_eq!(atoms[1].severity_hint, Severity::Medium);

        let payload = atoms[0].prompt_payload();
        assert_eq!(payload["failure_kind"], "timeout");
        assert!(payload.get("issue_title").is_none());
    }

    #[test]
    fn parse_atoms_document() {
        let text = r#"{"atoms":[{"atom_id":"a","run_rel":"r","source":"x","text":"t"}],"totals":{}}"#;
        let atoms = parse_atoms(text).unwrap();
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].run_key(), "r");
    }

    #[test]
    fn malformed_line_names_line_number() {
        let text = "{\"atom_id\":\"a\",\"text\":\"ok\"}\nnot json\n";
        let err = parse_atoms(text).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn empty_atom_id_is_rejected() {
        let err = parse_atoms("{\"atom_id\":\"  \",\"text\":\"x\"}\n").unwrap_err();
        assert!(err.to_string().contains("empty atom_id"));
    }

    #[test]
    fn aggregate_atoms_are_detected() {
        let atom = Atom::new("x", "__aggregate__/all", "confusion_point", "t");
        assert!(atom.is_aggregate());
        assert!(!Atom::new("x", "runs/a", "confusion_point", "t").is_aggregate());
    }

    #[test]
    fn select_evidence_respects_caps() {
        let catalog = AtomCatalog::new(vec![
            Atom::new("a", "r", "s", "x".repeat(10)),
            Atom::new("b", "r", "s", "y".repeat(10)),
            Atom::new("c", "r", "s", "z".repeat(10)),
        ]);
        let ids: Vec<String> = ["missing", "a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let (_, included) = catalog.select_evidence(&ids, 2, 0);
        assert_eq!(included, vec!["a", "b"]);

        let (_, included) = catalog.select_evidence(&ids, 0, 15);
        assert_eq!(included, vec!["a"]);

        // The first atom is always admitted, even over budget.
        let (atoms, included) = catalog.select_evidence(&ids, 0, 5);
        assert_eq!(included, vec!["a"]);
        assert_eq!(atoms.len(), 1);
    }

    #[test]
    fn catalog_drops_duplicate_ids() {
        let catalog = AtomCatalog::new(vec![
            Atom::new("a", "r1", "s", "first"),
            Atom::new("a", "r2", "s", "second"),
        ]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("a").unwrap().text, "first");
    }
}
