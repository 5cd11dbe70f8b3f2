//! Shared state for one mining run.

use std::path::PathBuf;
use std::sync::Arc;

use triage_engine::{
    DedupeThresholds, Embedder, HashingEmbedder, HeuristicTrustAssessor, SimilarityWeights,
    TrustAssessor,
};

use crate::adapter::AgentAdapter;
use crate::cache::fs::FsResultStore;
use crate::cache::{LookupOptions, ResultStore};
use crate::config::MiningConfig;
use crate::domain::atom::{Atom, AtomCatalog};
use crate::domain::error::Result;
use crate::executor::PromptExecutor;
use crate::prompts::PromptManifest;

/// Everything a unit of work reads. Built once, shared behind an `Arc`.
pub struct MiningContext {
    pub executor: PromptExecutor,
    pub store: Arc<dyn ResultStore>,
    pub manifest: PromptManifest,
    pub artifacts_dir: PathBuf,
    pub catalog: AtomCatalog,
    pub config: MiningConfig,
    /// Digest of agent, model and adapter identity.
    pub cfg_sha256: String,
    pub embedder: Arc<dyn Embedder>,
    pub similarity: SimilarityWeights,
    pub dedupe_thresholds: DedupeThresholds,
    pub trust: Arc<dyn TrustAssessor>,
}

impl MiningContext {
    /// Context with the filesystem store rooted at `artifacts_dir` and the
    /// default embedder and trust assessor.
    pub fn new(
        adapter: Arc<dyn AgentAdapter>,
        manifest: PromptManifest,
        atoms: Vec<Atom>,
        artifacts_dir: impl Into<PathBuf>,
        config: MiningConfig,
    ) -> Result<Self> {
        let artifacts_dir = artifacts_dir.into();
        let cfg_sha256 = config.cfg_sha256(&adapter.identity())?;
        Ok(Self {
            executor: PromptExecutor::new(adapter, config.agent.clone(), config.model.clone()),
            store: Arc::new(FsResultStore::new(&artifacts_dir)),
            manifest,
            artifacts_dir,
            catalog: AtomCatalog::new(atoms),
            config,
            cfg_sha256,
            embedder: Arc::new(HashingEmbedder::default()),
            similarity: SimilarityWeights::default(),
            dedupe_thresholds: DedupeThresholds::default(),
            trust: Arc::new(HeuristicTrustAssessor),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_similarity(mut self, weights: SimilarityWeights) -> Self {
        self.similarity = weights;
        self
    }

    pub fn with_trust_assessor(mut self, trust: Arc<dyn TrustAssessor>) -> Self {
        self.trust = trust;
        self
    }

    pub fn lookup_options(&self, allow_legacy: bool) -> LookupOptions {
        LookupOptions {
            resume: self.config.resume,
            force: self.config.force,
            allow_legacy: allow_legacy && self.config.accept_legacy_cache,
        }
    }
}
