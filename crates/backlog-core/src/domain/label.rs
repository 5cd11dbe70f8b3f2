//! Structured labels voted on by the labeler ensemble.
//!
//! Labeler output is loosely shaped model JSON. [`normalize_label`] maps it
//! onto closed enumerations; anything outside them falls back to a default
//! with a `warn!` instead of failing the ticket.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::ticket::{coerce_confidence, coerce_string, coerce_string_list};

/// Labeler stances, rotated across ensemble members.
pub const LABELER_VARIANTS: [&str; 3] = ["conservative", "balanced", "skeptical"];

/// Upper bound on `evidence_atom_ids_used` kept in a consensus label.
pub const DEFAULT_MAX_EVIDENCE_IDS_USED: usize = 32;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Kind of user-facing change a ticket implies.
///
/// Declared in alphabetical order so the derived `Ord` sorts like the
/// serialized names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSurfaceKind {
    BehaviorChange,
    BreakingChange,
    DocsChange,
    NewApi,
    NewCommand,
    NewConfigSchema,
    NewFlag,
    NewTopLevelMode,
    Unknown,
}

impl ChangeSurfaceKind {
    pub const ALL: [ChangeSurfaceKind; 9] = [
        ChangeSurfaceKind::BehaviorChange,
        ChangeSurfaceKind::BreakingChange,
        ChangeSurfaceKind::DocsChange,
        ChangeSurfaceKind::NewApi,
        ChangeSurfaceKind::NewCommand,
        ChangeSurfaceKind::NewConfigSchema,
        ChangeSurfaceKind::NewFlag,
        ChangeSurfaceKind::NewTopLevelMode,
        ChangeSurfaceKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeSurfaceKind::BehaviorChange => "behavior_change",
            ChangeSurfaceKind::BreakingChange => "breaking_change",
            ChangeSurfaceKind::DocsChange => "docs_change",
            ChangeSurfaceKind::NewApi => "new_api",
            ChangeSurfaceKind::NewCommand => "new_command",
            ChangeSurfaceKind::NewConfigSchema => "new_config_schema",
            ChangeSurfaceKind::NewFlag => "new_flag",
            ChangeSurfaceKind::NewTopLevelMode => "new_top_level_mode",
            ChangeSurfaceKind::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<ChangeSurfaceKind> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for ChangeSurfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Code area a ticket touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Docs,
    RunnerCore,
    SandboxRunner,
    AgentAdapters,
    Config,
    #[default]
    Unknown,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::Docs,
        Component::RunnerCore,
        Component::SandboxRunner,
        Component::AgentAdapters,
        Component::Config,
        Component::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Docs => "docs",
            Component::RunnerCore => "runner_core",
            Component::SandboxRunner => "sandbox_runner",
            Component::AgentAdapters => "agent_adapters",
            Component::Config => "config",
            Component::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Component> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

/// Risk that the change diverges from what users intended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentRisk {
    Low,
    #[default]
    Med,
    High,
}

impl IntentRisk {
    pub const ALL: [IntentRisk; 3] = [IntentRisk::Low, IntentRisk::Med, IntentRisk::High];

    pub fn as_str(self) -> &'static str {
        match self {
            IntentRisk::Low => "low",
            IntentRisk::Med => "med",
            IntentRisk::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<IntentRisk> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|r| r.as_str() == raw)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSurface {
    #[serde(default)]
    pub user_visible: bool,
    /// Sorted, unique, never empty (`unknown` when nothing else applies).
    pub kinds: Vec<ChangeSurfaceKind>,
    #[serde(default)]
    pub notes: String,
}

impl Default for ChangeSurface {
    fn default() -> Self {
        Self {
            user_visible: false,
            kinds: vec![ChangeSurfaceKind::Unknown],
            notes: String::new(),
        }
    }
}

/// One labeler's normalized answer, or the ensemble consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelPayload {
    pub change_surface: ChangeSurface,
    pub component: Component,
    pub intent_risk: IntentRisk,
    pub confidence: f64,
    #[serde(default)]
    pub evidence_atom_ids_used: Vec<String>,
}

impl Default for LabelPayload {
    fn default() -> Self {
        Self {
            change_surface: ChangeSurface::default(),
            component: Component::Unknown,
            intent_risk: IntentRisk::Med,
            confidence: 0.0,
            evidence_atom_ids_used: Vec::new(),
        }
    }
}

/// Map raw labeler JSON onto [`LabelPayload`].
pub fn normalize_label(raw: &Value) -> LabelPayload {
    let empty = serde_json::Map::new();
    let cs = raw
        .get("change_surface")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut kinds: BTreeSet<ChangeSurfaceKind> = coerce_string_list(cs.get("kinds"))
        .iter()
        .filter_map(|k| ChangeSurfaceKind::parse(k))
        .collect();
    if kinds.is_empty() {
        warn!(
            code = "labeler_unknown_change_surface",
            "labeler output had no valid change-surface kinds; defaulting to unknown"
        );
        kinds.insert(ChangeSurfaceKind::Unknown);
    }

    let component = match coerce_string(raw.get("component")) {
        None => Component::Unknown,
        Some(value) => Component::parse(&value).unwrap_or_else(|| {
            warn!(code = "labeler_unknown_component", value = %value, "unsupported component; defaulting to unknown");
            Component::Unknown
        }),
    };

    let intent_risk = match coerce_string(raw.get("intent_risk")) {
        None => IntentRisk::Med,
        Some(value) => IntentRisk::parse(&value).unwrap_or_else(|| {
            warn!(code = "labeler_unknown_intent_risk", value = %value, "unsupported intent_risk; defaulting to med");
            IntentRisk::Med
        }),
    };

    LabelPayload {
        change_surface: ChangeSurface {
            user_visible: truthy(cs.get("user_visible")),
            kinds: kinds.into_iter().collect(),
            notes: coerce_string(cs.get("notes")).unwrap_or_default(),
        },
        component,
        intent_risk,
        confidence: coerce_confidence(raw.get("confidence")),
        evidence_atom_ids_used: coerce_string_list(raw.get("evidence_atom_ids_used")),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Null) | None => false,
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Strict majority threshold for `n` voters.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Boolean vote; ties and empty input return `default`.
pub fn majority_bool(values: &[bool], default: bool) -> bool {
    let yes = values.iter().filter(|v| **v).count();
    let no = values.len() - yes;
    if yes == no {
        default
    } else {
        yes > no
    }
}

/// Categorical vote; the top value wins only with a strict majority.
pub fn majority_value<T: Copy + Eq + std::hash::Hash>(values: &[T], default: T) -> T {
    if values.is_empty() {
        return default;
    }
    let mut counts: Vec<(T, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((*value, 1)),
        }
    }
    // First-seen value wins ties on count, which matters only below majority.
    let (top, top_count) = counts
        .iter()
        .fold(counts[0], |best, cur| if cur.1 > best.1 { *cur } else { best });
    if top_count >= majority(values.len()) {
        top
    } else {
        default
    }
}

/// Reduce variant labels to one consensus label.
///
/// Returns the consensus and whether the variants disagreed on kinds,
/// visibility or component. No variants at all counts as disagreement.
pub fn consensus_label(variants: &[LabelPayload], max_evidence_ids: usize) -> (LabelPayload, bool) {
    if variants.is_empty() {
        return (LabelPayload::default(), true);
    }
    let need = majority(variants.len());

    let mut kind_votes: BTreeMap<ChangeSurfaceKind, usize> = BTreeMap::new();
    for variant in variants {
        let unique: BTreeSet<_> = variant.change_surface.kinds.iter().copied().collect();
        for kind in unique {
            *kind_votes.entry(kind).or_default() += 1;
        }
    }
    let mut kinds: Vec<ChangeSurfaceKind> = kind_votes
        .into_iter()
        .filter(|(kind, votes)| *votes >= need && *kind != ChangeSurfaceKind::Unknown)
        .map(|(kind, _)| kind)
        .collect();
    if kinds.is_empty() {
        kinds.push(ChangeSurfaceKind::Unknown);
    }

    let visibility: Vec<bool> = variants.iter().map(|v| v.change_surface.user_visible).collect();
    let components: Vec<Component> = variants.iter().map(|v| v.component).collect();
    let risks: Vec<IntentRisk> = variants.iter().map(|v| v.intent_risk).collect();

    let confidence = variants.iter().map(|v| v.confidence).sum::<f64>() / variants.len() as f64;

    let mut seen = HashSet::new();
    let evidence: Vec<String> = variants
        .iter()
        .flat_map(|v| v.evidence_atom_ids_used.iter())
        .filter(|id| seen.insert(id.as_str()))
        .take(max_evidence_ids)
        .cloned()
        .collect();

    let notes = variants
        .iter()
        .map(|v| v.change_surface.notes.trim())
        .find(|n| !n.is_empty())
        .unwrap_or_default()
        .to_string();

    let distinct_kinds: HashSet<&[ChangeSurfaceKind]> = variants
        .iter()
        .map(|v| v.change_surface.kinds.as_slice())
        .collect();
    let disagreement = distinct_kinds.len() > 1
        || visibility.iter().any(|v| *v != visibility[0])
        || components.iter().any(|c| *c != components[0]);

    (
        LabelPayload {
            change_surface: ChangeSurface {
                user_visible: majority_bool(&visibility, false),
                kinds,
                notes,
            },
            component: majority_value(&components, Component::Unknown),
            intent_risk: majority_value(&risks, IntentRisk::Med),
            confidence: confidence.clamp(0.0, 1.0),
            evidence_atom_ids_used: evidence,
        },
        disagreement,
    )
}
