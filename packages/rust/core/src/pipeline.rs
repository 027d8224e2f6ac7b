//! End-to-end research run: original list → plan → research → aggregate →
//! dedup → validate → report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use listscout_budget::{
    Attempted, BudgetTracker, ModelPricing, RetryExecutor, RetryPolicy, estimate_tokens,
};
use listscout_dedup::{DedupEngine, DedupOutcome, EmbeddingBatch, EmbeddingProvider};
use listscout_providers::{OriginalList, ResearchProvider, UrlValidator, load_original};
use listscout_shared::{
    AppConfig, Candidate, ListScoutError, ProviderError, Result, RunId, TaskResult,
};

use crate::aggregator::aggregate;
use crate::plan::ResearchPlan;
use crate::report::{RunReport, TaskRecord, derive_status, write_json};
use crate::scheduler::TaskScheduler;

/// Configuration for [`run_research`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Original list: a file path, a raw document URL, or a GitHub repository URL.
    pub original: String,
    /// Hand-written plan. Derived from the original list when unset.
    pub plan_path: Option<PathBuf>,
    /// Restrict the run to these categories; empty means all.
    pub categories: Vec<String>,
    /// Cancelled on user interrupt.
    pub shutdown: CancellationToken,
    pub app: AppConfig,
}

impl RunConfig {
    pub fn new(original: impl Into<String>, app: AppConfig) -> Self {
        Self {
            original: original.into(),
            plan_path: None,
            categories: Vec::new(),
            shutdown: CancellationToken::new(),
            app,
        }
    }
}

/// Result of [`run_research`].
#[derive(Debug)]
pub struct RunResult {
    /// Directory holding this run's output files.
    pub run_dir: PathBuf,
    /// Links that survived dedup and validation.
    pub new_links: Vec<Candidate>,
    pub report: RunReport,
}

/// Progress callback for the research pipeline.
pub trait ProgressReporter: Send + Sync {
    /// A new pipeline phase has started.
    fn phase(&self, name: &str);
    /// A category reached its terminal outcome.
    fn task_finished(&self, result: &TaskResult, finished: usize, total: usize);
    /// Pipeline finished.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter (for tests / non-interactive use).
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn task_finished(&self, _result: &TaskResult, _finished: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

/// Run the full research pipeline.
///
/// Output is written even when the run is cut short by the budget or the
/// wall-time limit; the report's status says which.
#[instrument(skip_all, fields(original = %config.original))]
pub async fn run_research(
    config: &RunConfig,
    research: Arc<dyn ResearchProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    progress: &dyn ProgressReporter,
) -> Result<RunResult> {
    let app = &config.app;
    app.validate()?;

    let run_id = RunId::new();
    let started_at = Utc::now();
    info!(%run_id, model = research.model(), "starting research run");

    // --- Phase 1: Original list ---
    progress.phase("Loading original list");
    let original = load_original(
        &config.original,
        Duration::from_secs(app.provider.timeout_secs),
    )
    .await?;

    // --- Phase 2: Plan ---
    progress.phase("Planning categories");
    let mut plan = match &config.plan_path {
        Some(path) => ResearchPlan::load(path)?,
        None => ResearchPlan::from_original(&original, &app.plan),
    };
    plan.retain_categories(&config.categories);
    plan.validate()?;

    // --- Phase 3: Research ---
    progress.phase("Researching categories");
    let budget = Arc::new(BudgetTracker::from_config(&app.budget));
    let policy = RetryPolicy::from(&app.retry);
    let scheduler = TaskScheduler::new(
        research.clone(),
        budget.clone(),
        policy.clone(),
        &app.scheduler,
    )
    .with_shutdown(config.shutdown.clone())
    .with_original(&original);
    let tasks = scheduler.run(&plan, progress).await;

    // --- Phase 4: Aggregate ---
    progress.phase("Aggregating candidates");
    let aggregated = aggregate(&plan, &tasks);

    // --- Phase 5: Dedup ---
    progress.phase("Deduplicating");
    let retry = RetryExecutor::new(policy, budget.clone());
    let dedup = dedup_engine(app, embedder, budget.clone(), retry)
        .run(&original.entries, &aggregated.candidates)
        .await;

    // --- Phase 6: Validate ---
    let (new_links, validation) = if app.validation.enabled {
        progress.phase("Validating links");
        let report = UrlValidator::new(&app.validation)?
            .validate(dedup.accepted.clone())
            .await;
        (report.valid.clone(), Some(report))
    } else {
        (dedup.accepted.clone(), None)
    };

    // --- Phase 7: Report ---
    progress.phase("Writing results");
    let cost = budget.report();
    let status = derive_status(&tasks, &cost);

    let mut warnings = Vec::new();
    if dedup.stats.high_duplication {
        warnings.push(format!(
            "high duplication: {:.0}% of candidates were already listed",
            dedup.stats.duplicate_ratio * 100.0
        ));
    }
    if dedup.stats.semantic_budget_skips > 0 {
        warnings.push(format!(
            "semantic dedup skipped for {} candidates: budget refused embeddings",
            dedup.stats.semantic_budget_skips
        ));
    }
    if cost.overshoot_usd > 0.0 {
        warnings.push(format!(
            "cost ceiling overshot by ${:.4}",
            cost.overshoot_usd
        ));
    }
    if new_links.len() < app.output.min_new_links {
        warnings.push(format!(
            "only {} new links found (expected at least {})",
            new_links.len(),
            app.output.min_new_links
        ));
    }
    for warning in &warnings {
        warn!(%run_id, "{warning}");
    }

    let report = RunReport {
        run_id: run_id.clone(),
        title: plan.title.clone(),
        model: research.model().to_string(),
        started_at,
        finished_at: Utc::now(),
        status,
        tasks: tasks.iter().map(TaskRecord::from).collect(),
        categories: aggregated.per_category.clone(),
        cost,
        dedup: dedup.stats.clone(),
        validation: validation.as_ref().map(|v| v.summary.clone()),
        new_links: new_links.len(),
        fingerprint: dedup.fingerprint(),
        warnings,
    };

    let run_dir = Path::new(&app.output.dir).join(run_id.to_string());
    std::fs::create_dir_all(&run_dir).map_err(|e| ListScoutError::io(&run_dir, e))?;
    write_json(&run_dir.join("new_links.json"), &new_links)?;
    write_json(&run_dir.join("aggregated.json"), &aggregated)?;
    write_json(&run_dir.join("dedup_stats.json"), &dedup.stats)?;
    write_json(&run_dir.join("dedup_decisions.json"), &dedup.decisions)?;
    if let Some(validation) = &validation {
        write_json(&run_dir.join("invalid_links.json"), &validation.invalid)?;
    }
    write_json(&run_dir.join("run_report.json"), &report)?;

    info!(
        %run_id,
        status = %report.status,
        candidates = report.dedup.total_candidates,
        accepted = report.dedup.accepted_count,
        new_links = report.new_links,
        spent_usd = report.cost.spent_usd,
        path = %run_dir.display(),
        "research run complete"
    );
    progress.done(&report);

    Ok(RunResult {
        run_dir,
        new_links,
        report,
    })
}

/// Deduplicate a saved candidate list against an original list, without
/// researching.
#[instrument(skip_all, fields(original = %original, candidates = %candidates_path.display()))]
pub async fn dedup_candidates(
    app: &AppConfig,
    original: &str,
    candidates_path: &Path,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<(OriginalList, DedupOutcome)> {
    app.validate()?;
    let content = std::fs::read_to_string(candidates_path)
        .map_err(|e| ListScoutError::io(candidates_path, e))?;
    let candidates: Vec<Candidate> = serde_json::from_str(&content)
        .map_err(|e| ListScoutError::parse(format!("invalid candidates JSON: {e}")))?;

    let original = load_original(original, Duration::from_secs(app.provider.timeout_secs)).await?;
    let budget = Arc::new(BudgetTracker::from_config(&app.budget));
    let retry = RetryExecutor::new(RetryPolicy::from(&app.retry), budget.clone());
    let outcome = dedup_engine(app, embedder, budget, retry)
        .run(&original.entries, &candidates)
        .await;
    Ok((original, outcome))
}

fn dedup_engine(
    app: &AppConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    budget: Arc<BudgetTracker>,
    retry: RetryExecutor,
) -> DedupEngine {
    let engine = DedupEngine::new(&app.dedup);
    match embedder {
        Some(inner) => engine.with_embedder(Arc::new(BudgetedEmbedder::new(inner, budget, retry))),
        None => engine,
    }
}

// ---------------------------------------------------------------------------
// Budgeted embeddings
// ---------------------------------------------------------------------------

/// Embedding provider whose batches are admitted and charged by the run
/// budget, with the run's retry policy applied.
struct BudgetedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    budget: Arc<BudgetTracker>,
    retry: RetryExecutor,
    pricing: ModelPricing,
}

impl BudgetedEmbedder {
    fn new(
        inner: Arc<dyn EmbeddingProvider>,
        budget: Arc<BudgetTracker>,
        retry: RetryExecutor,
    ) -> Self {
        let pricing = ModelPricing::for_model(inner.model());
        Self {
            inner,
            budget,
            retry,
            pricing,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for BudgetedEmbedder {
    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<EmbeddingBatch, ProviderError> {
        let tokens: u64 = texts.iter().map(|t| estimate_tokens(t)).sum();
        let estimate = self.pricing.cost_usd(tokens, 0);
        let reservation = self
            .budget
            .reserve(estimate)
            .map_err(|e| ProviderError::BudgetRefused(e.to_string()))?;

        let Attempted {
            result,
            attempts,
            failed_cost_usd,
        } = self
            .retry
            .run("embedding", || self.inner.embed_batch(texts))
            .await;

        let cost_usd = failed_cost_usd + result.as_ref().map_or(0.0, |batch| batch.cost_usd);
        self.budget.commit(reservation, cost_usd);
        debug!(
            texts = texts.len(),
            attempts,
            estimate_usd = estimate,
            cost_usd,
            "embedding batch charged"
        );
        result
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use listscout_providers::{ResearchOutput, ResearchRequest};
    use listscout_shared::{MatchLayerKind, RunStatus};

    use super::*;

    const ORIGINAL: &str = "\
# Awesome Testing

> Test tools.

## Runners

- [nextest](https://nexte.st) - Next-generation test runner.

## Fuzzing

- [cargo-fuzz](https://github.com/rust-fuzz/cargo-fuzz) - Fuzzing with libFuzzer.

## License

- [CC0](https://creativecommons.org/publicdomain/zero/1.0/)
";

    struct StaticProvider {
        cost_usd: f64,
    }

    impl Default for StaticProvider {
        fn default() -> Self {
            Self { cost_usd: 0.01 }
        }
    }

    #[async_trait]
    impl ResearchProvider for StaticProvider {
        async fn research(
            &self,
            request: &ResearchRequest<'_>,
        ) -> std::result::Result<ResearchOutput, ProviderError> {
            let category = request.category;
            let candidates = match category {
                "Runners" => vec![
                    candidate(category, "Nextest", "https://nexte.st/"),
                    candidate(category, "rstest", "https://github.com/la10736/rstest"),
                ],
                _ => vec![
                    candidate(category, "afl.rs", "https://github.com/rust-fuzz/afl.rs"),
                    candidate(category, "cargo fuzz", "http://www.github.com/rust-fuzz/cargo-fuzz"),
                ],
            };
            Ok(ResearchOutput {
                candidates,
                tokens_used: 800,
                cost_usd: self.cost_usd,
            })
        }

        fn model(&self) -> &str {
            "gpt-4o-mini"
        }
    }

    struct FlakyEmbedder {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<EmbeddingBatch, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::Unavailable("warming up".into()))
            } else {
                Ok(EmbeddingBatch {
                    vectors: texts.iter().map(|_| vec![1.0, 0.0]).collect(),
                    tokens_used: 10,
                    cost_usd: 0.001,
                })
            }
        }

        fn model(&self) -> &str {
            "text-embedding-3-small"
        }
    }

    /// Orthogonal vectors, one per text, at a fixed price per batch.
    struct CountingEmbedder {
        calls: AtomicU32,
        cost_usd: f64,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<EmbeddingBatch, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let vectors = (0..texts.len())
                .map(|i| {
                    let mut v = vec![0.0; texts.len()];
                    v[i] = 1.0;
                    v
                })
                .collect();
            Ok(EmbeddingBatch {
                vectors,
                tokens_used: 100,
                cost_usd: self.cost_usd,
            })
        }

        fn model(&self) -> &str {
            "text-embedding-3-small"
        }
    }

    fn candidate(category: &str, title: &str, url: &str) -> Candidate {
        Candidate {
            category: category.into(),
            title: title.into(),
            url: url.into(),
            description: String::new(),
            source_tag: "static".into(),
        }
    }

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("listscout-{label}-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(dir: &Path) -> RunConfig {
        let original = dir.join("README.md");
        std::fs::write(&original, ORIGINAL).unwrap();

        let mut app = AppConfig::default();
        app.output.dir = dir.join("runs").to_string_lossy().into_owned();
        app.validation.enabled = false;
        app.dedup.layers = vec![
            MatchLayerKind::Title,
            MatchLayerKind::EditDistance,
            MatchLayerKind::CanonicalUrl,
        ];
        RunConfig::new(original.to_string_lossy(), app)
    }

    #[tokio::test]
    async fn full_run_writes_outputs() {
        let dir = temp_dir("pipeline");
        let config = config(&dir);

        let provider = Arc::new(StaticProvider::default());
        let result = run_research(&config, provider, None, &SilentProgress)
            .await
            .unwrap();

        // "Nextest" and "cargo fuzz" duplicate the originals.
        let titles: Vec<_> = result.new_links.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["rstest", "afl.rs"]);

        let report = &result.report;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.dedup.total_candidates, 4);
        assert_eq!(report.dedup.rejected_count, 2);
        assert!(report.validation.is_none());
        assert!(report.warnings.iter().any(|w| w.contains("only 2 new links")));

        for file in [
            "new_links.json",
            "aggregated.json",
            "dedup_stats.json",
            "dedup_decisions.json",
            "run_report.json",
        ] {
            assert!(result.run_dir.join(file).exists(), "{file} missing");
        }
        assert!(!result.run_dir.join("invalid_links.json").exists());

        let saved: Vec<Candidate> = serde_json::from_str(
            &std::fs::read_to_string(result.run_dir.join("new_links.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved, result.new_links);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn category_filter_limits_research() {
        let dir = temp_dir("pipeline-filter");
        let mut config = config(&dir);
        config.categories = vec!["fuzzing".into()];

        let provider = Arc::new(StaticProvider::default());
        let result = run_research(&config, provider, None, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(result.report.tasks.len(), 1);
        assert_eq!(result.report.tasks[0].category, "Fuzzing");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_category_filter_is_an_error() {
        let dir = temp_dir("pipeline-empty");
        let mut config = config(&dir);
        config.categories = vec!["Benchmarks".into()];

        let provider = Arc::new(StaticProvider::default());
        let err = run_research(&config, provider, None, &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ListScoutError::Validation { .. }));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn embedder_failures_are_retried() {
        let budget = Arc::new(BudgetTracker::new(1.0, Duration::from_secs(60)));
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
        };
        let embedder = BudgetedEmbedder::new(
            Arc::new(FlakyEmbedder {
                calls: AtomicU32::new(0),
            }),
            budget.clone(),
            RetryExecutor::new(policy, budget.clone()),
        );
        let batch = embedder.embed_batch(&["x".to_string()]).await.unwrap();
        assert_eq!(batch.vectors, vec![vec![1.0, 0.0]]);
        assert!((budget.spent_usd() - 0.001).abs() < 1e-12);
        assert_eq!(budget.reserved_usd(), 0.0);
    }

    #[tokio::test]
    async fn refused_embedding_batch_is_never_sent() {
        let budget = Arc::new(BudgetTracker::new(1.0, Duration::from_secs(60)));
        let spent = budget.reserve(0.5).unwrap();
        budget.commit(spent, 2.0);

        let inner = Arc::new(CountingEmbedder {
            calls: AtomicU32::new(0),
            cost_usd: 0.5,
        });
        let embedder = BudgetedEmbedder::new(
            inner.clone(),
            budget.clone(),
            RetryExecutor::new(RetryPolicy::from(&AppConfig::default().retry), budget.clone()),
        );
        let err = embedder.embed_batch(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::BudgetRefused(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        assert!((budget.spent_usd() - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn embedding_spend_is_part_of_the_run_cost() {
        let dir = temp_dir("pipeline-embed");
        let mut config = config(&dir);
        config.app.plan.queries_per_category = 1;
        config.app.dedup.layers = MatchLayerKind::default_order();
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicU32::new(0),
            cost_usd: 0.5,
        });

        let result = run_research(
            &config,
            Arc::new(StaticProvider::default()),
            Some(embedder.clone()),
            &SilentProgress,
        )
        .await
        .unwrap();

        // Three originals and the two candidates left at the semantic layer.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        let report = &result.report;
        assert_eq!(report.dedup.accepted_count, 2);
        assert_eq!(report.dedup.semantic_budget_skips, 0);
        assert!((report.cost.spent_usd - 0.52).abs() < 1e-9);
        assert_eq!(report.status, RunStatus::Completed);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn closed_budget_skips_semantic_dedup() {
        let dir = temp_dir("pipeline-closed");
        let mut config = config(&dir);
        config.app.plan.queries_per_category = 1;
        config.app.budget.cost_ceiling_usd = 1.0;
        config.app.dedup.layers = MatchLayerKind::default_order();
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicU32::new(0),
            cost_usd: 0.5,
        });

        let result = run_research(
            &config,
            Arc::new(StaticProvider { cost_usd: 5.0 }),
            Some(embedder.clone()),
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        let report = &result.report;
        assert_eq!(report.dedup.semantic_budget_skips, 2);
        assert_eq!(report.dedup.embedding_failures, 0);
        assert_eq!(report.dedup.accepted_count, 2);
        assert!((report.cost.spent_usd - 10.0).abs() < 1e-9);
        assert!(report.cost.admission_closed);
        assert_eq!(report.status, RunStatus::BudgetExceeded);
        assert!(report.warnings.iter().any(|w| w.contains("semantic dedup skipped")));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dedup_only_run() {
        let dir = temp_dir("dedup-only");
        let config = config(&dir);
        let candidates_path = dir.join("candidates.json");
        let candidates = vec![
            candidate("Runners", "nextest", "https://nexte.st"),
            candidate("Runners", "rstest", "https://github.com/la10736/rstest"),
        ];
        std::fs::write(&candidates_path, serde_json::to_string(&candidates).unwrap()).unwrap();

        let (original, outcome) =
            dedup_candidates(&config.app, &config.original, &candidates_path, None)
                .await
                .unwrap();
        assert_eq!(original.entries.len(), 3);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].title, "rstest");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
