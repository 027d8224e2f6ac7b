//! Parallel execution of a research plan under one shared budget.
//!
//! Categories are admitted in plan order: each launch first reserves its
//! projected cost with the [`BudgetTracker`]. Admitted categories run as
//! tokio tasks in a [`JoinSet`], each bounded by the run deadline and a
//! shared [`CancellationToken`]. When the deadline passes, in-flight tasks
//! are cancelled; tasks still running after the grace period are aborted.
//!
//! Every category ends with exactly one [`TaskResult`], returned in plan
//! order regardless of completion order. A category's queries run one after
//! another under its single reservation and their candidates are merged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use listscout_budget::{
    Attempted, BudgetTracker, ModelPricing, Reservation, RetryExecutor, RetryPolicy,
};
use listscout_providers::{OriginalList, ResearchOutput, ResearchProvider, ResearchRequest};
use listscout_shared::{
    CancelReason, OriginalEntry, ProviderError, SchedulerConfig, TaskOutcome, TaskResult,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::pipeline::ProgressReporter;
use crate::plan::{CategoryPlan, ResearchPlan};

/// Existing entries shown to the provider per category.
const MAX_EXAMPLES: usize = 3;

/// What the original list already holds for one category.
#[derive(Debug, Default)]
struct CategoryContext {
    examples: Vec<OriginalEntry>,
    exclude_urls: Vec<String>,
}

/// Runs every category of a plan and collects their outcomes.
pub struct TaskScheduler {
    provider: Arc<dyn ResearchProvider>,
    budget: Arc<BudgetTracker>,
    retry: RetryExecutor,
    pricing: ModelPricing,
    default_expected_tokens: u64,
    cancel_grace: Duration,
    shutdown: CancellationToken,
    contexts: HashMap<String, Arc<CategoryContext>>,
}

impl TaskScheduler {
    pub fn new(
        provider: Arc<dyn ResearchProvider>,
        budget: Arc<BudgetTracker>,
        policy: RetryPolicy,
        config: &SchedulerConfig,
    ) -> Self {
        let pricing = ModelPricing::for_model(provider.model());
        Self {
            retry: RetryExecutor::new(policy, budget.clone()),
            provider,
            budget,
            pricing,
            default_expected_tokens: config.default_expected_tokens,
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            shutdown: CancellationToken::new(),
            contexts: HashMap::new(),
        }
    }

    /// Send each category's existing entries along with its queries: up to
    /// three as examples, and every URL as an exclusion.
    pub fn with_original(mut self, list: &OriginalList) -> Self {
        let mut contexts: HashMap<String, CategoryContext> = HashMap::new();
        for entry in &list.entries {
            let context = contexts.entry(entry.category.to_lowercase()).or_default();
            if context.examples.len() < MAX_EXAMPLES {
                context.examples.push(entry.clone());
            }
            context.exclude_urls.push(entry.url.clone());
        }
        self.contexts = contexts
            .into_iter()
            .map(|(category, context)| (category, Arc::new(context)))
            .collect();
        self
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Token that stops the run early (e.g. on Ctrl-C). Cancelled categories
    /// are recorded with [`CancelReason::Shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Execute `plan` and return one result per category, in plan order.
    #[instrument(skip_all, fields(categories = plan.categories.len()))]
    pub async fn run(&self, plan: &ResearchPlan, progress: &dyn ProgressReporter) -> Vec<TaskResult> {
        let total = plan.categories.len();
        let mut results: Vec<Option<TaskResult>> = vec![None; total];
        let mut finished = 0usize;
        let cancel = self.shutdown.child_token();
        let mut tasks = JoinSet::new();

        // --- Admission, in plan order ---
        for (index, entry) in plan.categories.iter().enumerate() {
            if cancel.is_cancelled() {
                let result = TaskResult::cancelled(&entry.category, CancelReason::Shutdown);
                finished += 1;
                progress.task_finished(&result, finished, total);
                results[index] = Some(result);
                continue;
            }

            let estimate = self
                .pricing
                .estimate_usd(entry.total_tokens(self.default_expected_tokens));
            let reservation = match self.budget.reserve(estimate) {
                Ok(reservation) => reservation,
                Err(e) => {
                    warn!(category = %entry.category, error = %e, "category not admitted");
                    let result = TaskResult::cancelled(&entry.category, e.cancel_reason());
                    finished += 1;
                    progress.task_finished(&result, finished, total);
                    results[index] = Some(result);
                    continue;
                }
            };

            debug!(
                category = %entry.category,
                queries = entry.queries.len(),
                estimate_usd = estimate,
                "category admitted"
            );
            tasks.spawn(run_category(CategoryTask {
                index,
                entry: entry.clone(),
                context: self.contexts.get(&entry.category.to_lowercase()).cloned(),
                provider: self.provider.clone(),
                budget: self.budget.clone(),
                retry: self.retry.clone(),
                cancel: cancel.clone(),
                deadline: self.budget.deadline(),
                reservation,
            }));
        }

        // --- Collection ---
        let run_deadline = self.budget.deadline();
        let mut grace_deadline: Option<Instant> = None;

        while !tasks.is_empty() {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, result))) => {
                        finished += 1;
                        progress.task_finished(&result, finished, total);
                        results[index] = Some(result);
                    }
                    Some(Err(e)) => warn!(error = %e, "research task ended abnormally"),
                    None => break,
                },
                () = tokio::time::sleep_until(run_deadline), if grace_deadline.is_none() => {
                    warn!(in_flight = tasks.len(), "wall-time deadline reached, cancelling in-flight tasks");
                    cancel.cancel();
                    grace_deadline = Some(self.grace_deadline(run_deadline));
                }
                () = self.shutdown.cancelled(), if grace_deadline.is_none() => {
                    warn!(in_flight = tasks.len(), "shutdown requested, cancelling in-flight tasks");
                    grace_deadline = Some(self.grace_deadline(run_deadline));
                }
                () = tokio::time::sleep_until(grace_deadline.unwrap_or(run_deadline)), if grace_deadline.is_some() => {
                    warn!(in_flight = tasks.len(), "tasks ignored cancellation, aborting");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok((index, result)) = joined {
                            finished += 1;
                            progress.task_finished(&result, finished, total);
                            results[index] = Some(result);
                        }
                    }
                }
            }
        }

        // --- Categories that ended without reporting ---
        let results: Vec<TaskResult> = results
            .into_iter()
            .zip(&plan.categories)
            .map(|(result, entry)| {
                result.unwrap_or_else(|| {
                    let result = if cancel.is_cancelled() {
                        TaskResult::cancelled(&entry.category, self.cancel_reason())
                    } else {
                        TaskResult {
                            outcome: TaskOutcome::Failed {
                                error: "task ended without a result".into(),
                            },
                            ..TaskResult::cancelled(&entry.category, CancelReason::Shutdown)
                        }
                    };
                    finished += 1;
                    progress.task_finished(&result, finished, total);
                    result
                })
            })
            .collect();

        let settled = self.budget.settle_outstanding();
        if settled > 0 {
            warn!(settled, "charged reservations of aborted tasks");
        }

        let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
        info!(
            succeeded,
            unsuccessful = results.len() - succeeded,
            spent_usd = self.budget.spent_usd(),
            elapsed_ms = self.budget.elapsed().as_millis() as u64,
            "research tasks finished"
        );
        results
    }

    /// End of the grace period starting now, or `fallback` when the period
    /// cannot be represented.
    fn grace_deadline(&self, fallback: Instant) -> Instant {
        let now = Instant::now();
        now.checked_add(self.cancel_grace).unwrap_or(fallback.max(now))
    }

    fn cancel_reason(&self) -> CancelReason {
        if self.budget.is_expired() {
            CancelReason::WallTime
        } else {
            CancelReason::Shutdown
        }
    }
}

// ---------------------------------------------------------------------------
// Per-category task
// ---------------------------------------------------------------------------

struct CategoryTask {
    index: usize,
    entry: CategoryPlan,
    context: Option<Arc<CategoryContext>>,
    provider: Arc<dyn ResearchProvider>,
    budget: Arc<BudgetTracker>,
    retry: RetryExecutor,
    cancel: CancellationToken,
    deadline: Instant,
    reservation: Reservation,
}

async fn run_category(task: CategoryTask) -> (usize, TaskResult) {
    let CategoryTask {
        index,
        entry,
        context,
        provider,
        budget,
        retry,
        cancel,
        deadline,
        reservation,
    } = task;
    let category = entry.category.as_str();

    let attempted = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        outcome = tokio::time::timeout_at(
            deadline,
            research_queries(&entry, context.as_deref(), provider.as_ref(), &retry),
        ) => outcome.ok(),
    };

    let Some(Attempted {
        result,
        attempts,
        failed_cost_usd,
    }) = attempted
    else {
        // Partial output is dropped; the held estimate stands in for the spend.
        let reason = if budget.is_expired() {
            CancelReason::WallTime
        } else {
            CancelReason::Shutdown
        };
        let held = reservation.estimate_usd();
        budget.commit(reservation, held);
        debug!(category, ?reason, "category cancelled");
        let mut result = TaskResult::cancelled(category, reason);
        result.cost_usd = held;
        return (index, result);
    };

    let result = match result {
        Ok(output) => {
            let cost_usd = output.cost_usd + failed_cost_usd;
            budget.commit(reservation, cost_usd);
            info!(
                category,
                candidates = output.candidates.len(),
                attempts,
                cost_usd,
                "category researched"
            );
            TaskResult {
                category: category.to_string(),
                candidates: output.candidates,
                tokens_used: output.tokens_used,
                cost_usd,
                attempt_count: attempts,
                outcome: TaskOutcome::Succeeded,
            }
        }
        Err(err) => {
            budget.commit(reservation, failed_cost_usd);
            warn!(category, attempts, error = %err, "category research failed");
            TaskResult {
                category: category.to_string(),
                candidates: Vec::new(),
                tokens_used: 0,
                cost_usd: failed_cost_usd,
                attempt_count: attempts,
                outcome: TaskOutcome::Failed {
                    error: err.to_string(),
                },
            }
        }
    };
    (index, result)
}

/// Research every query of `entry` in order. Candidates are merged by URL;
/// the category succeeds when any query does.
async fn research_queries(
    entry: &CategoryPlan,
    context: Option<&CategoryContext>,
    provider: &dyn ResearchProvider,
    retry: &RetryExecutor,
) -> Attempted<ResearchOutput, ProviderError> {
    let category = entry.category.as_str();
    let (examples, exclude_urls) = context.map_or((&[][..], &[][..]), |c| {
        (c.examples.as_slice(), c.exclude_urls.as_slice())
    });

    let mut merged: Option<ResearchOutput> = None;
    let mut last_error = None;
    let mut attempts = 0;
    let mut failed_cost_usd = 0.0;
    let mut seen = HashSet::new();

    for query in &entry.queries {
        let request = ResearchRequest {
            category,
            query,
            examples,
            exclude_urls,
        };
        let attempted = retry.run(category, || provider.research(&request)).await;
        attempts += attempted.attempts;
        failed_cost_usd += attempted.failed_cost_usd;

        match attempted.result {
            Ok(output) => {
                let merged = merged.get_or_insert_with(ResearchOutput::default);
                merged.tokens_used += output.tokens_used;
                merged.cost_usd += output.cost_usd;
                merged.candidates.extend(
                    output
                        .candidates
                        .into_iter()
                        .filter(|c| seen.insert(c.url.clone())),
                );
            }
            Err(err) => {
                debug!(category, query = %query, error = %err, "query failed");
                last_error = Some(err);
            }
        }
    }

    let result = match (merged, last_error) {
        (Some(output), _) => Ok(output),
        (None, Some(err)) => Err(err),
        (None, None) => Ok(ResearchOutput::default()),
    };
    Attempted {
        result,
        attempts,
        failed_cost_usd,
    }
}
