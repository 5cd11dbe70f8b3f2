//! Backlog Miner CLI
//!
//! The `backlog` command turns agent-run evidence atoms into a gated backlog.
//!
//! ## Commands
//!
//! - `mine`: run the full mining pipeline and write the backlog document
//! - `plan`: print the deterministic miner job plan without calling agents

mod adapter;

use anyhow::{Context, Result};
use atom_ledger::{AtomStatus, YamlAtomLedger};
use backlog_core::{
    filter_atoms_by_ledger, load_prompt_manifest, mine_backlog, plan_document, plan_jobs,
    read_atoms, update_ledger, write_backlog, Atom, LedgerExclusion, MiningConfig, MiningContext,
    DEFAULT_EXCLUDED_STATUSES, DEFAULT_TITLE,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use adapter::{AgentKind, SubprocessAdapter};

#[derive(Parser)]
#[command(name = "backlog")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mine agent-run evidence into a deduplicated, gated backlog", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mining pipeline and write the backlog
    Mine(MineArgs),

    /// Print the miner job plan as JSON without invoking agents
    Plan(PlanArgs),
}

/// Inputs and planning knobs shared by `mine` and `plan`.
#[derive(Args, Debug, Clone)]
struct InputArgs {
    /// Atoms file (JSONL, or a JSON document with an `atoms` array)
    #[arg(long, env = "BACKLOG_ATOMS")]
    atoms: PathBuf,

    /// Directory holding manifest.json and the prompt templates
    #[arg(long, env = "BACKLOG_PROMPTS_DIR")]
    prompts_dir: PathBuf,

    /// Agent CLI used for every generative call
    #[arg(long, value_enum, default_value = "claude", env = "BACKLOG_AGENT")]
    agent: AgentKind,

    /// Path to the agent binary (default: the agent name on PATH)
    #[arg(long, env = "BACKLOG_AGENT_BINARY")]
    agent_binary: Option<PathBuf>,

    /// Model override passed to the agent
    #[arg(long, env = "BACKLOG_MODEL")]
    model: Option<String>,

    /// Total miner jobs (coverage + bagging)
    #[arg(long, default_value_t = 10, env = "BACKLOG_MINERS")]
    miners: usize,

    /// Atoms per miner job; 0 means every atom
    #[arg(long, default_value_t = 120, env = "BACKLOG_SAMPLE_SIZE")]
    sample_size: usize,

    /// Miner jobs over disjoint atom partitions
    #[arg(long, default_value_t = 3, env = "BACKLOG_COVERAGE_MINERS")]
    coverage_miners: usize,

    /// Resampling miner jobs (default: miners - coverage miners)
    #[arg(long, env = "BACKLOG_BAGGING_MINERS")]
    bagging_miners: Option<usize>,

    /// Maximum tickets kept from one miner job
    #[arg(long, default_value_t = 12, env = "BACKLOG_MAX_TICKETS_PER_MINER")]
    max_tickets_per_miner: usize,

    /// Base seed for every sampling decision
    #[arg(long, default_value_t = 0, env = "BACKLOG_SEED")]
    seed: u64,

    /// Atom lifecycle ledger (YAML); read before planning, updated after mining
    #[arg(long, env = "BACKLOG_ATOM_LEDGER")]
    atom_ledger: Option<PathBuf>,

    /// Skip atoms whose ledger status is one of these (repeatable;
    /// default: ticketed, queued, actioned)
    #[arg(long = "exclude-atom-status", value_name = "STATUS")]
    exclude_atom_status: Vec<AtomStatus>,
}

#[derive(Args, Debug, Clone)]
struct MineArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Root directory for per-unit artifacts and the resume cache
    #[arg(long, env = "BACKLOG_ARTIFACTS_DIR")]
    artifacts_dir: PathBuf,

    /// Output path for the backlog JSON document
    #[arg(long, env = "BACKLOG_OUT_JSON")]
    out_json: PathBuf,

    /// Output path for the markdown rendering
    #[arg(long, env = "BACKLOG_OUT_MD")]
    out_md: Option<PathBuf>,

    /// Markdown title
    #[arg(long, default_value = DEFAULT_TITLE, env = "BACKLOG_TITLE")]
    title: String,

    /// Ignore cached outputs
    #[arg(long, env = "BACKLOG_NO_RESUME")]
    no_resume: bool,

    /// Re-run every unit even when its cache entry is valid
    #[arg(long, env = "BACKLOG_FORCE")]
    force: bool,

    /// Render and store prompts without calling the agent
    #[arg(long, env = "BACKLOG_DRY_RUN")]
    dry_run: bool,

    /// Skip the pairwise merge judge
    #[arg(long, env = "BACKLOG_NO_MERGE")]
    no_merge: bool,

    /// Orphan recovery pass budget
    #[arg(long = "orphan-pass", default_value_t = 1, env = "BACKLOG_ORPHAN_PASS")]
    orphan_pass: usize,

    /// Labeler variants per ticket (0 disables labeling)
    #[arg(long, default_value_t = 3, env = "BACKLOG_LABELERS")]
    labelers: usize,

    /// Maximum concurrent agent calls
    #[arg(long, default_value_t = 4, env = "BACKLOG_CONCURRENCY")]
    concurrency: usize,

    /// Re-run units whose cached output has no input manifest instead of
    /// reusing it as legacy
    #[arg(long, env = "BACKLOG_STRICT_CACHE")]
    strict_cache: bool,
}

#[derive(Args, Debug, Clone)]
struct PlanArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Write the plan here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl InputArgs {
    fn excluded_statuses(&self) -> Vec<AtomStatus> {
        if self.exclude_atom_status.is_empty() {
            DEFAULT_EXCLUDED_STATUSES.to_vec()
        } else {
            self.exclude_atom_status.clone()
        }
    }

    fn base_config(&self) -> MiningConfig {
        MiningConfig {
            agent: self.agent.as_str().to_string(),
            model: self.model.clone(),
            miners: self.miners,
            sample_size: self.sample_size,
            coverage_miners: self.coverage_miners,
            bagging_miners: self.bagging_miners,
            max_tickets_per_miner: self.max_tickets_per_miner,
            seed: self.seed,
            ..MiningConfig::default()
        }
        .with_env_caps()
    }

    fn adapter(&self) -> Arc<SubprocessAdapter> {
        Arc::new(SubprocessAdapter::new(self.agent, self.agent_binary.clone()))
    }
}

impl MineArgs {
    fn mining_config(&self) -> MiningConfig {
        MiningConfig {
            resume: !self.no_resume,
            force: self.force,
            dry_run: self.dry_run,
            merge_enabled: !self.no_merge,
            orphan_passes: self.orphan_pass,
            labelers: self.labelers,
            max_concurrent: self.concurrency.max(1),
            accept_legacy_cache: !self.strict_cache,
            ..self.input.base_config()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    backlog_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Mine(args) => cmd_mine(&args).await,
        Commands::Plan(args) => cmd_plan(&args).await,
    }
}

/// Atoms after the optional ledger filter.
async fn load_atoms(input: &InputArgs) -> Result<(Vec<Atom>, Option<LedgerExclusion>)> {
    let atoms = read_atoms(&input.atoms).context("Failed to load atoms")?;
    let Some(path) = &input.atom_ledger else {
        return Ok((atoms, None));
    };
    let ledger = YamlAtomLedger::new(path);
    let (kept, exclusion) = filter_atoms_by_ledger(atoms, &ledger, &input.excluded_statuses())
        .await
        .with_context(|| format!("Failed to read atom ledger {}", path.display()))?;
    info!(
        kept = exclusion.atoms_kept,
        total = exclusion.atoms_total,
        "filtered atoms by ledger status"
    );
    Ok((kept, Some(exclusion)))
}

fn input_metadata(args: &MineArgs, config: &MiningConfig, exclusion: Option<&LedgerExclusion>) -> Value {
    json!({
        "atoms_jsonl": args.input.atoms.display().to_string(),
        "prompts_dir": args.input.prompts_dir.display().to_string(),
        "agent": config.agent,
        "model": config.model,
        "miners": config.miners,
        "sample_size": config.sample_size,
        "coverage_miners": config.coverage_miners,
        "bagging_miners": config.bagging_miners,
        "max_tickets_per_miner": config.max_tickets_per_miner,
        "seed": config.seed,
        "resume": config.resume,
        "force": config.force,
        "dry_run": config.dry_run,
        "no_merge": !config.merge_enabled,
        "orphan_pass": config.orphan_passes,
        "labelers": config.labelers,
        "accept_legacy_cache": config.accept_legacy_cache,
        "atom_ledger": args.input.atom_ledger.as_ref().map(|p| p.display().to_string()),
        "ledger_filter": exclusion,
    })
}

/// Run the pipeline, update the ledger, write the outputs.
async fn cmd_mine(args: &MineArgs) -> Result<()> {
    let manifest = load_prompt_manifest(&args.input.prompts_dir).context("Invalid prompt manifest")?;
    let (atoms, exclusion) = load_atoms(&args.input).await?;
    let config = args.mining_config();
    let input = input_metadata(args, &config, exclusion.as_ref());

    std::fs::create_dir_all(&args.artifacts_dir)
        .with_context(|| format!("Failed to create {}", args.artifacts_dir.display()))?;
    let ctx = Arc::new(MiningContext::new(
        args.input.adapter(),
        manifest,
        atoms,
        &args.artifacts_dir,
        config,
    )?);

    let mut doc = mine_backlog(Arc::clone(&ctx), input).await?;

    if let Some(path) = &args.input.atom_ledger {
        let ledger = YamlAtomLedger::new(path);
        let backlog_json = args.out_json.display().to_string();
        let stats = update_ledger(&ledger, &ctx.catalog, &doc, Utc::now(), Some(&backlog_json))
            .await
            .with_context(|| format!("Failed to update atom ledger {}", path.display()))?;
        doc.ledger = Some(stats);
    }

    write_backlog(&doc, &args.out_json, args.out_md.as_deref(), &args.title)
        .context("Failed to write backlog")?;

    print_summary(&doc, &args.out_json, args.out_md.as_deref());
    Ok(())
}

fn print_summary(doc: &backlog_core::BacklogDocument, out_json: &Path, out_md: Option<&Path>) {
    let totals = &doc.totals;
    println!("Tickets: {}", totals.tickets);
    println!(
        "Miners: {} total, {} completed, {} failed",
        totals.miners_total, totals.miners_completed, totals.miners_failed
    );
    println!("Merge decisions: {}", totals.merge_decisions);
    println!(
        "Coverage: {}/{} atoms ({} high-severity uncovered)",
        doc.coverage.covered_atoms,
        totals.atoms,
        doc.coverage.uncovered_high_severity_atoms
    );
    if let Some(ledger) = &doc.ledger {
        println!(
            "Ledger: {} observed, {} created, {} promoted",
            ledger.observed_atoms, ledger.created_entries, ledger.promoted_entries
        );
    }
    println!("Wrote {}", out_json.display());
    if let Some(md) = out_md {
        println!("Wrote {}", md.display());
    }
}

/// Print or write the deterministic job plan.
async fn cmd_plan(args: &PlanArgs) -> Result<()> {
    let manifest = load_prompt_manifest(&args.input.prompts_dir).context("Invalid prompt manifest")?;
    let (atoms, _) = load_atoms(&args.input).await?;
    let scratch = tempfile::tempdir().context("Failed to create scratch dir")?;
    let ctx = MiningContext::new(
        args.input.adapter(),
        manifest,
        atoms,
        scratch.path(),
        args.input.base_config(),
    )?;
    let plan = plan_document(&plan_jobs(&ctx)?);
    let text = serde_json::to_string_pretty(&plan)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{text}\n"))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}
