//! Trust scoring for claims backed by evidence.
//!
//! The score is a bounded heuristic for ranking, not a probability.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// One piece of evidence behind a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustEvidence {
    pub evidence_id: Option<String>,
    /// Independent origin (e.g. a run).
    pub group: Option<String>,
    /// Producer (e.g. an agent).
    pub source: Option<String>,
    /// Domain kind (e.g. `run_failure_event`).
    pub kind: Option<String>,
    pub weight: f64,
}

impl Default for TrustEvidence {
    fn default() -> Self {
        Self {
            evidence_id: None,
            group: None,
            source: None,
            kind: None,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Low,
    Medium,
    High,
}

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Low => "low",
            TrustLevel::Medium => "medium",
            TrustLevel::High => "high",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intermediate signals behind a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustSignals {
    pub evidence_count: usize,
    pub group_count: usize,
    pub source_count: usize,
    pub total_weight: f64,
    pub kinds: BTreeMap<String, usize>,
    pub corroboration: f64,
    pub diversity: f64,
    pub weight_signal: f64,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustAssessment {
    pub score: f64,
    pub level: TrustLevel,
    pub signals: TrustSignals,
}

/// Score a claim from its evidence and an optional model confidence.
///
/// - corroboration: distinct groups (falls back to evidence count)
/// - diversity: distinct sources
/// - weight: summed evidence weight (NaN and negatives count as zero)
pub fn assess_trust(evidence: &[TrustEvidence], confidence: Option<f64>) -> TrustAssessment {
    let confidence = confidence.map(|c| if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) });

    let mut total_weight = 0.0;
    let mut groups = BTreeSet::new();
    let mut sources = BTreeSet::new();
    let mut kinds: BTreeMap<String, usize> = BTreeMap::new();
    for item in evidence {
        if item.weight.is_finite() && item.weight > 0.0 {
            total_weight += item.weight;
        }
        if let Some(group) = item.group.as_deref().filter(|g| !g.is_empty()) {
            groups.insert(group);
        }
        if let Some(source) = item.source.as_deref().filter(|s| !s.is_empty()) {
            sources.insert(source);
        }
        if let Some(kind) = item.kind.as_deref().filter(|k| !k.is_empty()) {
            *kinds.entry(kind.to_string()).or_default() += 1;
        }
    }

    let group_count = if groups.is_empty() {
        evidence.len()
    } else {
        groups.len()
    };
    let source_count = sources.len();

    let corroboration = 1.0 - (-0.75 * group_count as f64).exp();
    let diversity = if source_count > 0 {
        1.0 - (-0.55 * source_count as f64).exp()
    } else {
        0.0
    };
    let weight_signal = 1.0 - (-0.18 * total_weight).exp();

    let base = 0.58 * corroboration + 0.22 * weight_signal + 0.20 * diversity;
    let score = match confidence {
        Some(c) => 0.78 * base + 0.22 * c,
        None => base,
    }
    .clamp(0.0, 1.0);

    let level = if score >= 0.75 {
        TrustLevel::High
    } else if score >= 0.45 {
        TrustLevel::Medium
    } else {
        TrustLevel::Low
    };

    TrustAssessment {
        score,
        level,
        signals: TrustSignals {
            evidence_count: evidence.len(),
            group_count,
            source_count,
            total_weight,
            kinds,
            corroboration,
            diversity,
            weight_signal,
            confidence,
        },
    }
}

/// Pluggable trust scoring.
pub trait TrustAssessor: Send + Sync {
    fn assess(&self, evidence: &[TrustEvidence], confidence: Option<f64>) -> TrustAssessment;
}

/// [`assess_trust`] behind the [`TrustAssessor`] seam.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTrustAssessor;

impl TrustAssessor for HeuristicTrustAssessor {
    fn assess(&self, evidence: &[TrustEvidence], confidence: Option<f64>) -> TrustAssessment {
        assess_trust(evidence, confidence)
    }
}
