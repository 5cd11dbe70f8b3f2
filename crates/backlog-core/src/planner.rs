//! Deterministic miner job planning.
//!
//! Every random choice is driven by a `StdRng` seeded from
//! `base_seed + index * constant`, one generator per job, so a plan is
//! reproducible from (seed, atoms, knobs) alone and jobs can run in any
//! order or in parallel.

use std::collections::HashMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::MiningConfig;
use crate::domain::atom::{Atom, Severity};
use crate::domain::error::{BacklogError, Result};
use crate::prompts::PromptManifest;

/// Seed stride per coverage job.
const COVERAGE_SEED_STRIDE: u64 = 31;
/// Seed stride per bagging job.
const BAGGING_SEED_STRIDE: u64 = 97;
/// Seed stride per orphan pass.
const ORPHAN_SEED_STRIDE: u64 = 911;

/// Max atoms from one run in a coverage or bagging sample.
pub const MINER_RUN_CAP: usize = 6;
/// Max atoms from one run in an orphan sample.
pub const ORPHAN_RUN_CAP: usize = 8;

/// Source multipliers applied on top of the base weight of 1.0.
pub const SOURCE_WEIGHT_MULTIPLIERS: &[(&str, f64)] = &[
    ("run_failure_event", 3.0),
    ("agent_stderr", 2.0),
    ("agent_stderr_artifact", 2.0),
    ("suggested_change", 1.5),
];

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Sampling weight table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtomWeights {
    pub source_multipliers: &'static [(&'static str, f64)],
    /// Multiplier for `high` and `blocker` hints.
    pub high_severity: f64,
    pub low_severity: f64,
}

impl Default for AtomWeights {
    fn default() -> Self {
        Self {
            source_multipliers: SOURCE_WEIGHT_MULTIPLIERS,
            high_severity: 1.8,
            low_severity: 0.8,
        }
    }
}

impl AtomWeights {
    pub fn weight(&self, atom: &Atom) -> f64 {
        let source = atom.source.trim();
        let mut weight = self
            .source_multipliers
            .iter()
            .find(|(name, _)| *name == source)
            .map(|(_, m)| *m)
            .unwrap_or(1.0);
        match atom.severity_hint {
            Severity::High | Severity::Blocker => weight *= self.high_severity,
            Severity::Low => weight *= self.low_severity,
            Severity::Medium => {}
        }
        weight
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassType {
    Coverage,
    Bagging,
    Orphan,
}

impl PassType {
    pub fn as_str(self) -> &'static str {
        match self {
            PassType::Coverage => "coverage",
            PassType::Bagging => "bagging",
            PassType::Orphan => "orphan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSemantics {
    AllAtoms,
    FixedSample,
}

impl SampleSemantics {
    pub fn for_size(sample_size: usize) -> Self {
        if sample_size == 0 {
            SampleSemantics::AllAtoms
        } else {
            SampleSemantics::FixedSample
        }
    }
}

/// How a job's atoms were chosen; part of its cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionParams {
    pub selection_strategy: String,
    pub sample_size_requested: usize,
    pub sample_size_effective: usize,
    pub sample_size_semantics: SampleSemantics,
    pub run_cap: usize,
    pub selection_seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bagging_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_pass_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncovered_high_severity_atoms: Option<usize>,
}

/// One mining unit: a template applied to an atom subset.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerJob {
    pub tag: String,
    pub template: String,
    pub pass_type: PassType,
    pub atoms: Vec<Atom>,
    pub selection_params: SelectionParams,
}

impl MinerJob {
    pub fn atom_ids(&self) -> Vec<String> {
        self.atoms.iter().map(|a| a.atom_id.clone()).collect()
    }

    /// Plan summary without atom bodies.
    pub fn plan_entry(&self) -> Value {
        json!({
            "tag": self.tag,
            "template": self.template,
            "pass_type": self.pass_type,
            "atom_count": self.atoms.len(),
            "atom_ids": self.atom_ids(),
            "selection_params": self.selection_params,
        })
    }
}

/// Knobs the planner reads.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanConfig {
    pub miners: usize,
    pub sample_size: usize,
    pub coverage_miners: usize,
    pub bagging_miners: Option<usize>,
    pub seed: u64,
    pub weights: AtomWeights,
}

impl From<&MiningConfig> for PlanConfig {
    fn from(cfg: &MiningConfig) -> Self {
        Self {
            miners: cfg.miners,
            sample_size: cfg.sample_size,
            coverage_miners: cfg.coverage_miners,
            bagging_miners: cfg.bagging_miners,
            seed: cfg.seed,
            weights: AtomWeights::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Weighted sample without replacement, then a per-run cap.
///
/// Draws `size` atoms by weight (a shuffled copy when `size` covers every
/// atom), drops atoms past `run_cap` per run, and refills from a shuffled
/// remainder under the same cap. The result can be shorter than `size`
/// when the cap cannot be satisfied.
pub fn sample_with_run_cap<R: Rng + ?Sized>(
    atoms: &[Atom],
    size: usize,
    rng: &mut R,
    run_cap: usize,
    weights: &AtomWeights,
) -> Vec<Atom> {
    if size == 0 || atoms.is_empty() {
        return Vec::new();
    }

    let mut sampled: Vec<usize> = Vec::with_capacity(size.min(atoms.len()));
    if size >= atoms.len() {
        sampled.extend(0..atoms.len());
        sampled.shuffle(rng);
    } else {
        let mut pool: Vec<usize> = (0..atoms.len()).collect();
        let max_attempts = (size * 30).max(100);
        let mut attempts = 0;
        while sampled.len() < size && !pool.is_empty() && attempts < max_attempts {
            attempts += 1;
            let pool_weights: Vec<f64> = pool.iter().map(|&i| weights.weight(&atoms[i])).collect();
            let Ok(dist) = WeightedIndex::new(&pool_weights) else {
                break;
            };
            let pick = dist.sample(rng);
            sampled.push(pool.remove(pick));
        }
        if sampled.len() < size {
            pool.shuffle(rng);
            let missing = size - sampled.len();
            sampled.extend(pool.into_iter().take(missing));
        }
    }

    let mut taken = vec![false; atoms.len()];
    let mut run_counts: HashMap<&str, usize> = HashMap::new();
    let mut capped: Vec<usize> = Vec::with_capacity(sampled.len());
    let mut admit = |idx: usize, capped: &mut Vec<usize>, taken: &mut Vec<bool>| {
        let count = run_counts.entry(atoms[idx].run_key()).or_default();
        if *count >= run_cap {
            return;
        }
        *count += 1;
        capped.push(idx);
        taken[idx] = true;
    };

    for idx in sampled {
        if capped.len() >= size {
            break;
        }
        admit(idx, &mut capped, &mut taken);
    }

    if capped.len() < size.min(atoms.len()) {
        let mut remainder: Vec<usize> = (0..atoms.len()).filter(|&i| !taken[i]).collect();
        remainder.shuffle(rng);
        for idx in remainder {
            if capped.len() >= size {
                break;
            }
            admit(idx, &mut capped, &mut taken);
        }
    }

    capped.into_iter().map(|i| atoms[i].clone()).collect()
}

/// Deal atoms into `parts` chunks round-robin.
pub fn partition_round_robin(atoms: &[Atom], parts: usize) -> Vec<Vec<Atom>> {
    let mut chunks = vec![Vec::new(); parts];
    if parts == 0 {
        return chunks;
    }
    for (idx, atom) in atoms.iter().enumerate() {
        chunks[idx % parts].push(atom.clone());
    }
    chunks
}

fn template_at(templates: &[String], idx: usize) -> Result<String> {
    if templates.is_empty() {
        return Err(BacklogError::config("prompt manifest has an empty template list"));
    }
    Ok(templates[idx % templates.len()].clone())
}

fn effective_size(requested: usize, available: usize) -> usize {
    if requested == 0 {
        available
    } else {
        requested.min(available)
    }
}

/// Build the coverage then bagging jobs.
///
/// Coverage jobs sample disjoint round-robin chunks of the shuffled atoms;
/// bagging jobs each resample the full shuffled set with their own seed.
/// Bagging fills every miner slot coverage does not use.
pub fn plan_miner_jobs(
    atoms: &[Atom],
    manifest: &PromptManifest,
    cfg: &PlanConfig,
) -> Result<Vec<MinerJob>> {
    if cfg.miners == 0 {
        return Ok(Vec::new());
    }
    let coverage_count = cfg.coverage_miners.min(cfg.miners);
    let free = cfg.miners - coverage_count;
    let mut bagging_count = cfg.bagging_miners.unwrap_or(free).min(free);
    bagging_count += free - bagging_count;

    let mut ordered = atoms.to_vec();
    ordered.shuffle(&mut StdRng::seed_from_u64(cfg.seed));

    let semantics = SampleSemantics::for_size(cfg.sample_size);
    let mut jobs = Vec::with_capacity(cfg.miners);

    for (offset, chunk) in partition_round_robin(&ordered, coverage_count)
        .into_iter()
        .enumerate()
    {
        let idx = offset + 1;
        let sample_n = effective_size(cfg.sample_size, chunk.len());
        let seed = cfg
            .seed
            .wrapping_add((idx as u64).wrapping_mul(COVERAGE_SEED_STRIDE));
        let mut rng = StdRng::seed_from_u64(seed);
        let sample = sample_with_run_cap(&chunk, sample_n, &mut rng, MINER_RUN_CAP, &cfg.weights);
        jobs.push(MinerJob {
            tag: format!("miner_{idx:03}"),
            template: template_at(&manifest.coverage_templates, offset)?,
            pass_type: PassType::Coverage,
            atoms: sample,
            selection_params: SelectionParams {
                selection_strategy: "coverage_partition_weighted_sample_with_run_cap".into(),
                sample_size_requested: cfg.sample_size,
                sample_size_effective: sample_n,
                sample_size_semantics: semantics,
                run_cap: MINER_RUN_CAP,
                selection_seed: seed,
                coverage_index: Some(idx),
                bagging_index: None,
                orphan_pass_index: None,
                uncovered_high_severity_atoms: None,
            },
        });
    }

    for offset in 0..bagging_count {
        let idx = coverage_count + offset + 1;
        let sample_n = effective_size(cfg.sample_size, ordered.len());
        let seed = cfg
            .seed
            .wrapping_add((idx as u64).wrapping_mul(BAGGING_SEED_STRIDE));
        let mut rng = StdRng::seed_from_u64(seed);
        let sample = sample_with_run_cap(&ordered, sample_n, &mut rng, MINER_RUN_CAP, &cfg.weights);
        jobs.push(MinerJob {
            tag: format!("miner_{idx:03}"),
            template: template_at(&manifest.bagging_templates, offset)?,
            pass_type: PassType::Bagging,
            atoms: sample,
            selection_params: SelectionParams {
                selection_strategy: "bagging_weighted_sample_with_run_cap".into(),
                sample_size_requested: cfg.sample_size,
                sample_size_effective: sample_n,
                sample_size_semantics: semantics,
                run_cap: MINER_RUN_CAP,
                selection_seed: seed,
                coverage_index: None,
                bagging_index: Some(offset + 1),
                orphan_pass_index: None,
                uncovered_high_severity_atoms: None,
            },
        });
    }

    Ok(jobs)
}

/// Orphan job for pass `pass_idx` over the uncovered high-severity atoms.
///
/// Returns `None` when there is nothing to sample.
pub fn plan_orphan_job(
    uncovered_high: &[Atom],
    manifest: &PromptManifest,
    sample_size: usize,
    base_seed: u64,
    pass_idx: usize,
    weights: &AtomWeights,
) -> Option<MinerJob> {
    if uncovered_high.is_empty() {
        return None;
    }
    let seed = base_seed.wrapping_add((pass_idx as u64).wrapping_mul(ORPHAN_SEED_STRIDE));
    let sample_n = effective_size(sample_size, uncovered_high.len());
    let mut rng = StdRng::seed_from_u64(seed);
    let sample = sample_with_run_cap(uncovered_high, sample_n, &mut rng, ORPHAN_RUN_CAP, weights);
    if sample.is_empty() {
        return None;
    }
    Some(MinerJob {
        tag: format!("orphan_{pass_idx:03}"),
        template: manifest.orphan_template.clone(),
        pass_type: PassType::Orphan,
        atoms: sample,
        selection_params: SelectionParams {
            selection_strategy: "orphan_high_severity_weighted_sample_with_run_cap".into(),
            sample_size_requested: sample_size,
            sample_size_effective: sample_n,
            sample_size_semantics: SampleSemantics::for_size(sample_size),
            run_cap: ORPHAN_RUN_CAP,
            selection_seed: seed,
            coverage_index: None,
            bagging_index: None,
            orphan_pass_index: Some(pass_idx),
            uncovered_high_severity_atoms: Some(uncovered_high.len()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    fn manifest() -> PromptManifest {
        let names = ["cov_a.md", "cov_b.md", "bag.md", "orphan.md", "merge.md", "label.md"];
        let templates: BTreeMap<String, String> =
            names.iter().map(|n| (n.to_string(), format!("body {n}"))).collect();
        PromptManifest::from_parts(
            "prompts",
            vec!["cov_a.md".into(), "cov_b.md".into()],
            vec!["bag.md".into()],
            "orphan.md",
            "merge.md",
            "label.md",
            templates,
        )
        .unwrap()
    }

    fn atoms(n: usize, runs: usize) -> Vec<Atom> {
        (0..n)
            .map(|i| Atom::new(format!("a{i:03}"), format!("run{}", i % runs), "confusion_point", format!("text {i}")))
            .collect()
    }

    fn cfg(miners: usize, coverage: usize, sample: usize) -> PlanConfig {
        PlanConfig {
            miners,
            sample_size: sample,
            coverage_miners: coverage,
            bagging_miners: None,
            seed: 7,
            weights: AtomWeights::default(),
        }
    }

    #[test]
    fn weights_follow_source_and_severity() {
        let w = AtomWeights::default();
        let base = Atom::new("a", "r", "confusion_point", "t");
        assert_eq!(w.weight(&base), 1.0);
        let failure = Atom::new("a", "r", "run_failure_event", "t").with_severity(Severity::Blocker);
        assert!((w.weight(&failure) - 5.4).abs() < 1e-9);
        let low = Atom::new("a", "r", "suggested_change", "t").with_severity(Severity::Low);
        assert!((w.weight(&low) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn plan_is_deterministic() {
        let atoms = atoms(60, 12);
        let a = plan_miner_jobs(&atoms, &manifest(), &cfg(5, 2, 10)).unwrap();
        let b = plan_miner_jobs(&atoms, &manifest(), &cfg(5, 2, 10)).unwrap();
        assert_eq!(a, b);
        let entries_a: Vec<Value> = a.iter().map(MinerJob::plan_entry).collect();
        let entries_b: Vec<Value> = b.iter().map(MinerJob::plan_entry).collect();
        assert_eq!(
            serde_json::to_string(&entries_a).unwrap(),
            serde_json::to_string(&entries_b).unwrap()
        );

        let mut other = cfg(5, 2, 10);
        other.seed = 8;
        assert_ne!(a, plan_miner_jobs(&atoms, &manifest(), &other).unwrap());
    }

    #[test]
    fn job_layout_tags_and_templates() {
        let jobs = plan_miner_jobs(&atoms(30, 10), &manifest(), &cfg(5, 3, 4)).unwrap();
        let tags: Vec<&str> = jobs.iter().map(|j| j.tag.as_str()).collect();
        assert_eq!(tags, vec!["miner_001", "miner_002", "miner_003", "miner_004", "miner_005"]);
        assert_eq!(jobs[0].template, "cov_a.md");
        assert_eq!(jobs[1].template, "cov_b.md");
        assert_eq!(jobs[2].template, "cov_a.md");
        assert_eq!(jobs[3].pass_type, PassType::Bagging);
        assert_eq!(jobs[3].selection_params.bagging_index, Some(1));
        assert_eq!(jobs[4].selection_params.selection_seed, 7 + 5 * 97);
        assert_eq!(jobs[0].selection_params.selection_seed, 7 + 31);
        assert!(jobs.iter().all(|j| j.atoms.len() == 4));
    }

    #[test]
    fn coverage_chunks_are_disjoint_and_complete_with_all_atoms() {
        let atoms = atoms(25, 25);
        let jobs = plan_miner_jobs(&atoms, &manifest(), &cfg(3, 3, 0)).unwrap();
        assert_eq!(jobs.len(), 3);
        let mut seen = HashSet::new();
        for job in &jobs {
            assert_eq!(job.selection_params.sample_size_semantics, SampleSemantics::AllAtoms);
            for atom in &job.atoms {
                assert!(seen.insert(atom.atom_id.clone()), "atom in two coverage chunks");
            }
        }
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn run_cap_limits_one_run() {
        let mut atoms = atoms(20, 1);
        atoms.extend((0..3).map(|i| Atom::new(format!("b{i}"), "other", "x", "t")));
        let mut rng = StdRng::seed_from_u64(1);
        let sample = sample_with_run_cap(&atoms, 10, &mut rng, MINER_RUN_CAP, &AtomWeights::default());
        let from_run0 = sample.iter().filter(|a| a.run_key() == "run0").count();
        assert_eq!(from_run0, MINER_RUN_CAP);
        assert_eq!(sample.len(), MINER_RUN_CAP + 3);
    }

    #[test]
    fn sample_has_no_duplicates() {
        let atoms = atoms(40, 20);
        let mut rng = StdRng::seed_from_u64(3);
        let sample = sample_with_run_cap(&atoms, 15, &mut rng, 6, &AtomWeights::default());
        let ids: HashSet<_> = sample.iter().map(|a| &a.atom_id).collect();
        assert_eq!(ids.len(), 15);
    }

    #[test]
    fn bagging_fills_unused_slots() {
        let mut c = cfg(6, 2, 5);
        c.bagging_miners = Some(1);
        let jobs = plan_miner_jobs(&atoms(20, 5), &manifest(), &c).unwrap();
        assert_eq!(jobs.len(), 6);
        assert_eq!(jobs.iter().filter(|j| j.pass_type == PassType::Bagging).count(), 4);
    }

    #[test]
    fn zero_miners_or_oversized_coverage() {
        assert!(plan_miner_jobs(&atoms(5, 1), &manifest(), &cfg(0, 3, 5)).unwrap().is_empty());
        let jobs = plan_miner_jobs(&atoms(5, 5), &manifest(), &cfg(2, 9, 5)).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.pass_type == PassType::Coverage));
    }

    #[test]
    fn orphan_job_samples_only_given_atoms() {
        let uncovered: Vec<Atom> = atoms(12, 2)
            .into_iter()
            .map(|a| a.with_severity(Severity::High))
            .collect();
        let job = plan_orphan_job(&uncovered, &manifest(), 0, 5, 2, &AtomWeights::default()).unwrap();
        assert_eq!(job.tag, "orphan_002");
        assert_eq!(job.template, "orphan.md");
        assert_eq!(job.atoms.len(), 12);
        assert_eq!(job.selection_params.selection_seed, 5 + 2 * 911);
        assert_eq!(job.selection_params.uncovered_high_severity_atoms, Some(12));
        assert!(plan_orphan_job(&[], &manifest(), 0, 5, 1, &AtomWeights::default()).is_none());
    }
}
