//! Backlog tickets: parsing model output, the deterministic merge rule and
//! identity anchors.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::atom::Severity;
use crate::domain::digest::sha256_text;
use crate::domain::label::{ChangeSurface, Component, IntentRisk, LabelPayload};

/// Risk tag added when labelers disagree on a ticket.
pub const RISK_INTENT_MISMATCH: &str = "intent_mismatch_risk";

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Triage,
    ResearchRequired,
    ReadyForTicket,
    Blocked,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Triage => "triage",
            Stage::ResearchRequired => "research_required",
            Stage::ReadyForTicket => "ready_for_ticket",
            Stage::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RawTicket
// ---------------------------------------------------------------------------

fn one() -> u32 {
    1
}

/// A ticket as produced by a miner, merged by dedup, and annotated by the
/// labeler ensemble.
///
/// `evidence_atom_ids` is never empty: tickets without evidence are
/// rejected at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTicket {
    pub title: String,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub user_impact: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub confidence: f64,
    pub evidence_atom_ids: Vec<String>,
    #[serde(default)]
    pub investigation_steps: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_owner: Option<String>,
    #[serde(default = "one")]
    pub merged_count: u32,

    // Labeler consensus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_surface: Option<ChangeSurface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_risk: Option<IntentRisk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeler_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labeler_evidence_atom_ids_used: Vec<String>,

    // Policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
}

impl RawTicket {
    /// Ticket with a title and evidence; everything else empty.
    pub fn new<S: AsRef<str>>(title: impl Into<String>, evidence: &[S]) -> Self {
        let evidence: BTreeSet<String> = evidence.iter().map(|s| s.as_ref().to_string()).collect();
        Self {
            title: title.into(),
            problem: String::new(),
            user_impact: String::new(),
            severity: Severity::Medium,
            confidence: 0.0,
            evidence_atom_ids: evidence.into_iter().collect(),
            investigation_steps: Vec::new(),
            success_criteria: Vec::new(),
            proposed_fix: None,
            suggested_owner: None,
            merged_count: 1,
            change_surface: None,
            component: None,
            intent_risk: None,
            labeler_confidence: None,
            labeler_evidence_atom_ids_used: Vec::new(),
            stage: None,
            risks: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage.unwrap_or_default()
    }

    /// Add a risk tag once.
    pub fn add_risk(&mut self, risk: &str) {
        if !self.risks.iter().any(|r| r == risk) {
            self.risks.push(risk.to_string());
        }
    }

    /// Copy a consensus label onto the ticket.
    pub fn apply_label(&mut self, label: &LabelPayload) {
        self.change_surface = Some(label.change_surface.clone());
        self.component = Some(label.component);
        self.intent_risk = Some(label.intent_risk);
        self.labeler_confidence = Some(label.confidence);
        self.labeler_evidence_atom_ids_used = label.evidence_atom_ids_used.clone();
    }

    /// Subset sent to labelers and hashed into their cache key.
    pub fn labeler_payload(&self) -> Value {
        serde_json::json!({
            "title": self.title,
            "problem": self.problem,
            "user_impact": self.user_impact,
            "severity": self.severity.as_str(),
            "confidence": self.confidence,
            "evidence_atom_ids": self.evidence_atom_ids,
            "proposed_fix": self.proposed_fix,
            "investigation_steps": self.investigation_steps,
            "success_criteria": self.success_criteria,
        })
    }
}

// ---------------------------------------------------------------------------
// Coercion helpers
// ---------------------------------------------------------------------------

/// Trimmed non-empty string, else `None`.
pub fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}

/// Trimmed non-empty strings of a JSON list; anything else is dropped.
pub fn coerce_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| coerce_string(Some(item)))
            .collect(),
        _ => Vec::new(),
    }
}

/// Confidence clamped to `[0, 1]`.
///
/// Booleans map to 1/0 and numeric strings are parsed; anything else
/// present is logged and read as 0.
pub fn coerce_confidence(value: Option<&Value>) -> f64 {
    match value {
        None | Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Number(n)) => n.as_f64().map(clamp01).unwrap_or(0.0),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => clamp01(parsed),
            _ => {
                warn!(code = "invalid_confidence_string", value = %s, "non-numeric confidence; using 0.0");
                0.0
            }
        },
        Some(other) => {
            warn!(code = "invalid_confidence_type", value = %other, "non-numeric confidence; using 0.0");
            0.0
        }
    }
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Drop a surrounding Markdown code fence (```json ... ```), if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => return trimmed,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// First JSON value starting at an `open` character that decodes cleanly.
fn first_embedded_json(text: &str, open: char, want: fn(&Value) -> bool) -> Option<Value> {
    for (idx, ch) in text.char_indices() {
        if ch != open {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if want(&value) {
                return Some(value);
            }
        }
    }
    None
}

/// Decode the first JSON object in free-form model output.
pub fn parse_first_json_object(raw: &str) -> Option<Map<String, Value>> {
    let text = strip_code_fence(raw);
    if text.is_empty() {
        return None;
    }
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
        return Some(obj);
    }
    match first_embedded_json(text, '{', Value::is_object) {
        Some(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// Validate one raw ticket object.
pub fn normalize_ticket(raw: &Value, index: usize) -> Result<RawTicket, String> {
    let title = coerce_string(raw.get("title"))
        .ok_or_else(|| format!("tickets[{index}] missing required non-empty field: title"))?;

    let evidence: BTreeSet<String> = coerce_string_list(raw.get("evidence_atom_ids"))
        .into_iter()
        .collect();
    if evidence.is_empty() {
        return Err(format!("tickets[{index}] missing required evidence_atom_ids"));
    }

    let investigation_steps = coerce_string_list(raw.get("investigation_steps"));
    let proposed_fix = coerce_string(raw.get("proposed_fix"));
    if investigation_steps.is_empty() && proposed_fix.is_none() {
        return Err(format!(
            "tickets[{index}] should include investigation_steps or proposed_fix"
        ));
    }

    let mut ticket = RawTicket::new(title, &evidence.into_iter().collect::<Vec<_>>());
    ticket.problem = coerce_string(raw.get("problem")).unwrap_or_default();
    ticket.user_impact = coerce_string(raw.get("user_impact")).unwrap_or_default();
    ticket.severity = coerce_string(raw.get("severity"))
        .map(|s| Severity::parse_lenient(&s))
        .unwrap_or_default();
    ticket.confidence = coerce_confidence(raw.get("confidence"));
    ticket.investigation_steps = investigation_steps;
    ticket.success_criteria = coerce_string_list(raw.get("success_criteria"));
    ticket.proposed_fix = proposed_fix;
    ticket.suggested_owner = coerce_string(raw.get("suggested_owner"));
    if let Some(count) = raw.get("merged_count").and_then(Value::as_u64) {
        ticket.merged_count = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
    }
    Ok(ticket)
}

/// Parse a miner response into tickets plus human-readable errors.
///
/// Accepts a bare JSON array, an object wrapping the array under
/// `tickets`, or either embedded in prose. Invalid items are reported and
/// skipped; valid ones are kept.
pub fn parse_ticket_list(text: &str) -> (Vec<RawTicket>, Vec<String>) {
    let raw = strip_code_fence(text);
    if raw.is_empty() {
        return (Vec::new(), vec!["empty output".to_string()]);
    }

    let mut errors = Vec::new();
    let mut parsed = match serde_json::from_str::<Value>(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            errors.push(format!("json_parse_failed: {e}"));
            None
        }
    };
    if parsed.is_none() {
        parsed = first_embedded_json(raw, '[', Value::is_array);
    }
    if let Some(Value::Object(obj)) = parsed.as_mut() {
        if let Some(tickets @ Value::Array(_)) = obj.remove("tickets") {
            parsed = Some(tickets);
        }
    }

    let Some(Value::Array(items)) = parsed else {
        errors.push("could not locate a JSON ticket array".to_string());
        return (Vec::new(), errors);
    };

    let mut tickets = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        if !item.is_object() {
            errors.push(format!("tickets[{idx}] is not an object"));
            continue;
        }
        match normalize_ticket(item, idx) {
            Ok(ticket) => tickets.push(ticket),
            Err(e) => errors.push(e),
        }
    }
    (tickets, errors)
}

// ---------------------------------------------------------------------------
// Merge rule
// ---------------------------------------------------------------------------

fn union_ordered(a: &[String], b: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    a.iter()
        .chain(b.iter())
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

/// Deterministic merge of two tickets describing the same issue.
///
/// Evidence is the sorted union, severity and confidence take the maximum,
/// step lists are unioned in order, and `base` wins every other field it
/// has a value for.
pub fn merge_two_tickets(base: &RawTicket, incoming: &RawTicket) -> RawTicket {
    let mut merged = base.clone();

    let evidence: BTreeSet<&String> = base
        .evidence_atom_ids
        .iter()
        .chain(incoming.evidence_atom_ids.iter())
        .collect();
    merged.evidence_atom_ids = evidence.into_iter().cloned().collect();

    if incoming.severity.rank() > base.severity.rank() {
        merged.severity = incoming.severity;
    }
    merged.confidence = base.confidence.max(incoming.confidence);
    merged.investigation_steps =
        union_ordered(&base.investigation_steps, &incoming.investigation_steps);
    merged.success_criteria = union_ordered(&base.success_criteria, &incoming.success_criteria);

    if merged.proposed_fix.is_none() {
        merged.proposed_fix = incoming.proposed_fix.clone();
    }
    if merged.problem.trim().is_empty() {
        merged.problem = incoming.problem.clone();
    }
    if merged.user_impact.trim().is_empty() {
        merged.user_impact = incoming.user_impact.clone();
    }
    if merged.suggested_owner.is_none() {
        merged.suggested_owner = incoming.suggested_owner.clone();
    }
    merged.merged_count = base.merged_count.max(1).saturating_add(incoming.merged_count.max(1));
    merged
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity anchor: lowercase title plus sorted evidence ids, as JSON.
pub fn ticket_anchor(ticket: &RawTicket) -> String {
    let mut evidence: Vec<&String> = ticket.evidence_atom_ids.iter().collect();
    evidence.sort();
    let evidence: Vec<String> = evidence
        .into_iter()
        .map(|id| Value::String(id.clone()).to_string())
        .collect();
    format!(
        "{{\"title\": {}, \"evidence\": [{}]}}",
        Value::String(ticket.title.trim().to_lowercase()),
        evidence.join(", ")
    )
}

/// First 16 hex chars of SHA-256 over [`ticket_anchor`]; filesystem-safe.
pub fn ticket_fingerprint(ticket: &RawTicket) -> String {
    sha256_text(&ticket_anchor(ticket))[..16].to_string()
}

/// Keep the first ticket for each anchor.
pub fn dedupe_by_anchor(tickets: Vec<RawTicket>) -> Vec<RawTicket> {
    let mut seen = HashSet::new();
    tickets
        .into_iter()
        .filter(|ticket| seen.insert(ticket_anchor(ticket)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_array() {
        let text = r#"[{"title":"Crash on start","severity":"HIGH","confidence":0.9,
            "evidence_atom_ids":["b","a","a"],"proposed_fix":"guard null"}]"#;
        let (tickets, errors) = parse_ticket_list(text);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].severity, Severity::High);
        assert_eq!(tickets[0].evidence_atom_ids, vec!["a", "b"]);
        assert_eq!(tickets[0].merged_count, 1);
    }

    #[test]
    fn strict_array_is_not_discarded_by_wrapper_check() {
        let text = json!([
            {"title": "Crash", "evidence_atom_ids": ["a"], "proposed_fix": "x"},
            {"title": "Hang", "evidence_atom_ids": ["b"], "investigation_steps": ["s"]}
        ])
        .to_string();
        let (tickets, errors) = parse_ticket_list(&text);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(tickets.len(), 2);

        let embedded = format!("Tickets follow.\n{text}\nDone.");
        let (tickets, _) = parse_ticket_list(&embedded);
        assert_eq!(tickets.len(), 2);
    }

    #[test]
    fn object_without_tickets_is_not_an_array() {
        let (tickets, errors) = parse_ticket_list(r#"{"items": []}"#);
        assert!(tickets.is_empty());
        assert_eq!(errors, vec!["could not locate a JSON ticket array"]);
    }

    #[test]
    fn merged_count_saturates() {
        let mut a = RawTicket::new("Crash", &["a"]);
        a.merged_count = u32::MAX;
        let merged = merge_two_tickets(&a, &RawTicket::new("Crash", &["b"]));
        assert_eq!(merged.merged_count, u32::MAX);
    }

    #[test]
    fn parses_wrapped_and_fenced_output() {
        let text = "```json\n{\"tickets\": [{\"title\": \"T\", \"evidence_atom_ids\": [\"a\"], \"investigation_steps\": [\"look\"]}]}\n```";
        let (tickets, errors) = parse_ticket_list(text);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(tickets.len(), 1);
    }

    #[test]
    fn finds_array_embedded_in_prose() {
        let text = "Here you go [see below]:\n[{\"title\":\"T\",\"evidence_atom_ids\":[\"a\"],\"proposed_fix\":\"f\"}]\nThanks";
        let (tickets, errors) = parse_ticket_list(text);
        assert_eq!(tickets.len(), 1);
        assert!(errors[0].starts_with("json_parse_failed"));
    }

    #[test]
    fn reports_item_errors_and_keeps_valid_items() {
        let text = json!([
            "not an object",
            {"title": "", "evidence_atom_ids": ["a"], "proposed_fix": "x"},
            {"title": "No evidence", "evidence_atom_ids": [], "proposed_fix": "x"},
            {"title": "No plan", "evidence_atom_ids": ["a"]},
            {"title": "Good", "evidence_atom_ids": ["a"], "investigation_steps": ["s"]}
        ])
        .to_string();
        let (tickets, errors) = parse_ticket_list(&text);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].title, "Good");
        assert_eq!(
            errors,
            vec![
                "tickets[0] is not an object",
                "tickets[1] missing required non-empty field: title",
                "tickets[2] missing required evidence_atom_ids",
                "tickets[3] should include investigation_steps or proposed_fix",
            ]
        );
    }

    #[test]
    fn empty_and_arrayless_output() {
        assert_eq!(parse_ticket_list("   ").1, vec!["empty output"]);
        let (tickets, errors) = parse_ticket_list("I could not find any issues.");
        assert!(tickets.is_empty());
        assert_eq!(errors.last().unwrap(), "could not locate a JSON ticket array");
    }

    #[test]
    fn confidence_coercion() {
        assert_eq!(coerce_confidence(Some(&json!(true))), 1.0);
        assert_eq!(coerce_confidence(Some(&json!(7))), 1.0);
        assert_eq!(coerce_confidence(Some(&json!(-1))), 0.0);
        assert_eq!(coerce_confidence(Some(&json!(" 0.25 "))), 0.25);
        assert_eq!(coerce_confidence(Some(&json!("high"))), 0.0);
        assert_eq!(coerce_confidence(Some(&json!({"v": 1}))), 0.0);
        assert_eq!(coerce_confidence(None), 0.0);
    }

    #[test]
    fn merge_rule_unions_and_maximizes() {
        let mut a = RawTicket::new("Crash", &["a1", "a2"]);
        a.severity = Severity::Medium;
        a.confidence = 0.4;
        a.investigation_steps = vec!["reproduce".into(), "bisect".into()];
        a.proposed_fix = Some("fix A".into());
        let mut b = RawTicket::new("Crash on boot", &["a2", "b1"]);
        b.severity = Severity::High;
        b.confidence = 0.8;
        b.investigation_steps = vec!["bisect".into(), "read logs".into()];
        b.problem = "boot fails".into();
        b.suggested_owner = Some("runtime".into());
        b.proposed_fix = Some("fix B".into());

        let merged = merge_two_tickets(&a, &b);
        assert_eq!(merged.title, "Crash");
        assert_eq!(merged.evidence_atom_ids, vec!["a1", "a2", "b1"]);
        assert_eq!(merged.severity, Severity::High);
        assert_eq!(merged.confidence, 0.8);
        assert_eq!(merged.investigation_steps, vec!["reproduce", "bisect", "read logs"]);
        assert_eq!(merged.proposed_fix.as_deref(), Some("fix A"));
        assert_eq!(merged.problem, "boot fails");
        assert_eq!(merged.suggested_owner.as_deref(), Some("runtime"));
        assert_eq!(merged.merged_count, 2);

        let again = merge_two_tickets(&merged, &RawTicket::new("x", &["z"]));
        assert_eq!(again.merged_count, 3);
    }

    #[test]
    fn anchor_ignores_case_and_evidence_order() {
        let a = RawTicket::new("Crash On Start", &["b", "a"]);
        let mut b = RawTicket::new("crash on start", &["a", "b"]);
        b.evidence_atom_ids = vec!["b".into(), "a".into()];
        assert_eq!(ticket_anchor(&a), ticket_anchor(&b));
        assert_eq!(ticket_anchor(&a), r#"{"title": "crash on start", "evidence": ["a", "b"]}"#);
        assert_eq!(ticket_fingerprint(&a).len(), 16);
        assert_eq!(dedupe_by_anchor(vec![a, b]).len(), 1);
    }

    #[test]
    fn first_json_object_skips_prose_and_braces() {
        let obj = parse_first_json_object("verdict {not json} {\"same_issue\": true}").unwrap();
        assert_eq!(obj["same_issue"], json!(true));
        assert!(parse_first_json_object("nothing here").is_none());
        assert!(parse_first_json_object("").is_none());
    }

    #[test]
    fn serde_round_trip_keeps_merged_count_default() {
        let ticket: RawTicket =
            serde_json::from_value(json!({"title": "T", "evidence_atom_ids": ["a"]})).unwrap();
        assert_eq!(ticket.merged_count, 1);
        assert_eq!(ticket.stage(), Stage::Triage);
        let value = serde_json::to_value(&ticket).unwrap();
        assert!(value.get("change_surface").is_none());
        assert!(value.get("risks").is_none());
    }
}
