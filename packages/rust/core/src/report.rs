//! Run reports and output files.

use std::path::Path;

use chrono::{DateTime, Utc};
use listscout_budget::CostReport;
use listscout_dedup::DedupStats;
use listscout_providers::ValidationSummary;
use listscout_shared::{CancelReason, ListScoutError, Result, RunId, RunStatus, TaskOutcome, TaskResult};
use serde::Serialize;
use tracing::debug;

use crate::aggregator::CategoryCount;

/// Per-category line of the run report. Candidates are counted, not listed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub category: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
    pub candidates: usize,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub attempt_count: u32,
}

impl From<&TaskResult> for TaskRecord {
    fn from(result: &TaskResult) -> Self {
        Self {
            category: result.category.clone(),
            outcome: result.outcome.clone(),
            candidates: result.candidates.len(),
            tokens_used: result.tokens_used,
            cost_usd: result.cost_usd,
            attempt_count: result.attempt_count,
        }
    }
}

/// Everything a caller needs to judge a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub title: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub tasks: Vec<TaskRecord>,
    pub categories: Vec<CategoryCount>,
    pub cost: CostReport,
    pub dedup: DedupStats,
    pub validation: Option<ValidationSummary>,
    /// Links in `new_links.json` after dedup and validation.
    pub new_links: usize,
    pub fingerprint: String,
    pub warnings: Vec<String>,
}

/// Terminal status of a run.
///
/// Wall-time cancellation outranks budget refusal, which outranks task
/// failures. An external shutdown counts as a partial failure.
pub fn derive_status(tasks: &[TaskResult], cost: &CostReport) -> RunStatus {
    let cancelled_by = |reason: CancelReason| {
        tasks
            .iter()
            .any(|t| t.outcome == TaskOutcome::Cancelled { reason })
    };

    if cancelled_by(CancelReason::WallTime) {
        RunStatus::WallTimeExceeded
    } else if cancelled_by(CancelReason::BudgetRefused) || cost.overshoot_usd > 0.0 {
        RunStatus::BudgetExceeded
    } else if cancelled_by(CancelReason::Shutdown)
        || tasks
            .iter()
            .any(|t| matches!(t.outcome, TaskOutcome::Failed { .. }))
    {
        RunStatus::PartialFailure
    } else {
        RunStatus::Completed
    }
}

/// Write a JSON file (pretty-printed).
pub(crate) fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| ListScoutError::validation(format!("JSON serialization failed: {e}")))?;
    std::fs::write(path, json).map_err(|e| ListScoutError::io(path, e))?;
    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cost(overshoot_usd: f64) -> CostReport {
        CostReport {
            spent_usd: 1.0,
            reserved_usd: 0.0,
            cost_ceiling_usd: 10.0,
            percentage_used: 10.0,
            overshoot_usd,
            max_reservation_usd: 0.05,
            elapsed_secs: 1.0,
            wall_time_limit_secs: 60.0,
            refused_admissions: 0,
            admission_closed: false,
        }
    }

    fn task(outcome: TaskOutcome) -> TaskResult {
        TaskResult {
            outcome,
            ..TaskResult::cancelled("Tools", CancelReason::Shutdown)
        }
    }

    fn cancelled(reason: CancelReason) -> TaskResult {
        TaskResult::cancelled("Tools", reason)
    }

    #[test]
    fn all_successful_is_completed() {
        let tasks = vec![task(TaskOutcome::Succeeded), task(TaskOutcome::Succeeded)];
        assert_eq!(derive_status(&tasks, &cost(0.0)), RunStatus::Completed);
    }

    #[test]
    fn status_precedence() {
        let failed = task(TaskOutcome::Failed {
            error: "x".into(),
        });
        assert_eq!(
            derive_status(&[failed.clone()], &cost(0.0)),
            RunStatus::PartialFailure
        );
        assert_eq!(
            derive_status(
                &[failed.clone(), cancelled(CancelReason::BudgetRefused)],
                &cost(0.0)
            ),
            RunStatus::BudgetExceeded
        );
        assert_eq!(
            derive_status(
                &[
                    failed,
                    cancelled(CancelReason::BudgetRefused),
                    cancelled(CancelReason::WallTime)
                ],
                &cost(0.0)
            ),
            RunStatus::WallTimeExceeded
        );
    }

    #[test]
    fn overshoot_alone_is_budget_exceeded() {
        let tasks = vec![task(TaskOutcome::Succeeded)];
        assert_eq!(derive_status(&tasks, &cost(0.2)), RunStatus::BudgetExceeded);
    }

    #[test]
    fn shutdown_is_partial_failure() {
        let tasks = vec![task(TaskOutcome::Succeeded), cancelled(CancelReason::Shutdown)];
        assert_eq!(derive_status(&tasks, &cost(0.0)), RunStatus::PartialFailure);
    }

    #[test]
    fn task_record_flattens_outcome() {
        let record = TaskRecord::from(&cancelled(CancelReason::WallTime));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "cancelled");
        assert_eq!(json["reason"], "wall_time");
        assert_eq!(json["candidates"], 0);
    }
}
