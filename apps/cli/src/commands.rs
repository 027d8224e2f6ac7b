//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use listscout_core::{
    ProgressReporter, ResearchPlan, RunConfig, RunReport, SilentProgress, dedup_candidates,
    run_research,
};
use listscout_dedup::EmbeddingProvider;
use listscout_providers::{OpenAiEmbedder, OpenAiResearcher, load_original};
use listscout_shared::{
    AppConfig, MatchLayerKind, TaskOutcome, TaskResult, init_config, load_config,
    load_config_from, validate_api_key,
};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// listscout: find new links for an awesome list within a fixed budget.
#[derive(Parser)]
#[command(
    name = "listscout",
    version,
    about = "Research new links for an awesome list under a cost ceiling and wall-time limit.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.listscout/listscout.toml).
    #[arg(long, global = true, env = "LISTSCOUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Research every category of a list and write the new links.
    Run {
        /// Original list: README path, raw URL, or GitHub repository URL.
        original: String,

        #[command(flatten)]
        plan: PlanArgs,

        /// Cost ceiling in USD.
        #[arg(long)]
        budget: Option<f64>,

        /// Wall-time limit in seconds.
        #[arg(long)]
        wall_time: Option<u64>,

        /// Research model id.
        #[arg(long)]
        model: Option<String>,

        /// Subject of the list, used in research prompts.
        #[arg(long)]
        topic: Option<String>,

        /// Root directory for run output.
        #[arg(short, long)]
        out: Option<String>,

        /// Skip link liveness checks.
        #[arg(long)]
        no_validate: bool,

        /// Skip the embedding-based dedup layer.
        #[arg(long)]
        no_semantic: bool,
    },

    /// Deduplicate a saved candidate list against an original list.
    Dedup {
        /// Original list: README path, raw URL, or GitHub repository URL.
        original: String,

        /// JSON array of candidates.
        candidates: PathBuf,

        /// Write decisions and stats to this file.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Skip the embedding-based dedup layer.
        #[arg(long)]
        no_semantic: bool,
    },

    /// Show the research plan and its projected cost.
    Plan {
        /// Original list: README path, raw URL, or GitHub repository URL.
        original: String,

        #[command(flatten)]
        plan: PlanArgs,

        /// Price the plan for this model instead of the configured one.
        #[arg(long)]
        model: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Plan selection shared by `run` and `plan`.
#[derive(clap::Args)]
pub(crate) struct PlanArgs {
    /// Research plan TOML (derived from the list sections when omitted).
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Only research these categories (repeatable).
    #[arg(short, long = "category")]
    pub categories: Vec<String>,

    /// Queries per derived category.
    #[arg(long)]
    pub queries: Option<usize>,

    /// Seed for the order of expanded queries.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl PlanArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(queries) = self.queries {
            config.plan.queries_per_category = queries;
        }
        if self.seed.is_some() {
            config.plan.seed = self.seed;
        }
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "listscout=info",
        1 => "listscout=debug",
        _ => "listscout=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    // A spinner would interleave with JSON log lines.
    let interactive = matches!(cli.log_format, LogFormat::Text);
    match cli.command {
        Command::Run {
            original,
            plan,
            budget,
            wall_time,
            model,
            topic,
            out,
            no_validate,
            no_semantic,
        } => {
            let mut config = resolve_config(config_path.as_deref())?;
            if let Some(budget) = budget {
                config.budget.cost_ceiling_usd = budget;
            }
            if let Some(secs) = wall_time {
                config.budget.wall_time_secs = secs;
            }
            if let Some(model) = model {
                config.provider.research_model = model;
            }
            if let Some(out) = out {
                config.output.dir = out;
            }
            if no_validate {
                config.validation.enabled = false;
            }
            plan.apply(&mut config);
            cmd_run(config, original, plan, topic, no_semantic, interactive).await
        }
        Command::Dedup {
            original,
            candidates,
            out,
            no_semantic,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_dedup(&config, &original, &candidates, out.as_deref(), no_semantic).await
        }
        Command::Plan {
            original,
            plan,
            model,
        } => {
            let mut config = resolve_config(config_path.as_deref())?;
            plan.apply(&mut config);
            cmd_plan(&config, &original, &plan, model.as_deref()).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path.as_deref()).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: AppConfig,
    original: String,
    plan: PlanArgs,
    topic: Option<String>,
    no_semantic: bool,
    interactive: bool,
) -> Result<()> {
    // Validate API key before doing anything
    let api_key = validate_api_key(&config)?;

    let mut researcher = OpenAiResearcher::new(&config.provider, api_key.clone())?;
    if let Some(topic) = topic {
        researcher = researcher.with_topic(topic);
    }
    let embedder = embedder(&config, api_key, no_semantic)?;

    let mut run_config = RunConfig::new(original, config);
    run_config.plan_path = plan.plan;
    run_config.categories = plan.categories;

    // Ctrl-C stops admission and cancels in-flight categories; output is
    // still written.
    let shutdown = run_config.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping research");
            shutdown.cancel();
        }
    });

    info!(
        original = %run_config.original,
        budget_usd = run_config.app.budget.cost_ceiling_usd,
        wall_time_secs = run_config.app.budget.wall_time_secs,
        "starting research"
    );

    let reporter: Box<dyn ProgressReporter> = if interactive {
        Box::new(CliProgress::new())
    } else {
        Box::new(SilentProgress)
    };
    let result =
        run_research(&run_config, Arc::new(researcher), embedder, reporter.as_ref()).await?;
    let report = &result.report;

    // Print summary
    println!();
    println!("  Research run finished: {}", report.status);
    println!("  Run ID:     {}", report.run_id);
    println!(
        "  Categories: {} succeeded / {} total",
        report.tasks.iter().filter(|t| t.outcome.is_success()).count(),
        report.tasks.len()
    );
    println!(
        "  Candidates: {} ({} duplicates, {:.0}%)",
        report.dedup.total_candidates,
        report.dedup.rejected_count,
        report.dedup.duplicate_ratio * 100.0
    );
    println!("  New links:  {}", report.new_links);
    println!(
        "  Cost:       ${:.4} of ${:.2} ({:.1}%)",
        report.cost.spent_usd, report.cost.cost_ceiling_usd, report.cost.percentage_used
    );
    println!("  Time:       {:.1}s", report.cost.elapsed_secs);
    println!("  Path:       {}", result.run_dir.display());
    for warning in &report.warnings {
        println!("  Warning:    {warning}");
    }
    println!();

    Ok(())
}

async fn cmd_dedup(
    config: &AppConfig,
    original: &str,
    candidates: &Path,
    out: Option<&Path>,
    no_semantic: bool,
) -> Result<()> {
    let embedder = if wants_semantic(config, no_semantic) {
        let api_key = validate_api_key(config)?;
        embedder(config, api_key, false)?
    } else {
        None
    };

    let (list, outcome) = dedup_candidates(config, original, candidates, embedder).await?;
    let stats = &outcome.stats;

    println!();
    println!("  Original:   {} ({} entries)", list.title, list.entries.len());
    println!("  Candidates: {}", stats.total_candidates);
    println!("  Accepted:   {}", stats.accepted_count);
    println!(
        "  Rejected:   {} ({:.0}%)",
        stats.rejected_count,
        stats.duplicate_ratio * 100.0
    );
    for (layer, count) in &stats.per_layer_rejections {
        println!("    {layer:<14} {count}");
    }
    if stats.high_duplication {
        println!("  Warning:    high duplication ratio");
    }
    if stats.semantic_budget_skips > 0 {
        println!(
            "  Warning:    budget refused embeddings for {} candidates",
            stats.semantic_budget_skips
        );
    }
    println!();

    if let Some(out) = out {
        let json = serde_json::to_string_pretty(&outcome)?;
        std::fs::write(out, json).map_err(|e| eyre!("cannot write {}: {e}", out.display()))?;
        println!("  Decisions written to {}", out.display());
    }
    Ok(())
}

async fn cmd_plan(
    config: &AppConfig,
    original: &str,
    args: &PlanArgs,
    model: Option<&str>,
) -> Result<()> {
    let mut plan = match &args.plan {
        Some(path) => ResearchPlan::load(path)?,
        None => {
            let list = load_original(
                original,
                Duration::from_secs(config.provider.timeout_secs),
            )
            .await?;
            ResearchPlan::from_original(&list, &config.plan)
        }
    };
    plan.retain_categories(&args.categories);
    config.validate()?;
    plan.validate()?;

    let model = model.unwrap_or(&config.provider.research_model);
    let estimate = plan.estimate(model, config.scheduler.default_expected_tokens);

    println!();
    println!("  Plan: {} ({} categories, model {model})", plan.title, plan.categories.len());
    for (entry, cost) in plan.categories.iter().zip(&estimate.categories) {
        println!(
            "    {:<30} {:>7} tokens  ${:.4}  \"{}\"",
            entry.category,
            cost.expected_tokens,
            cost.projected_usd,
            entry.queries.join("\" | \"")
        );
    }
    println!(
        "  Projected: ${:.4} of ${:.2} ceiling",
        estimate.total_usd, config.budget.cost_ceiling_usd
    );
    if estimate.total_usd > config.budget.cost_ceiling_usd {
        println!("  Warning:   later categories will be refused admission");
    }
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn wants_semantic(config: &AppConfig, no_semantic: bool) -> bool {
    !no_semantic && config.dedup.layers.contains(&MatchLayerKind::Semantic)
}

fn embedder(
    config: &AppConfig,
    api_key: String,
    no_semantic: bool,
) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    if !wants_semantic(config, no_semantic) {
        return Ok(None);
    }
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbedder::new(&config.provider, api_key)?);
    Ok(Some(embedder))
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("spinner template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn task_finished(&self, result: &TaskResult, finished: usize, total: usize) {
        let outcome = match &result.outcome {
            TaskOutcome::Succeeded => format!("{} candidates", result.candidates.len()),
            TaskOutcome::Failed { .. } => "failed".to_string(),
            TaskOutcome::Cancelled { reason } => format!("cancelled ({reason:?})"),
        };
        self.spinner.set_message(format!(
            "Researching [{finished}/{total}] {}: {outcome}",
            result.category
        ));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
