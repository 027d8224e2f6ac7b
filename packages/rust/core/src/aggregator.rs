//! Merge per-category results into one ordered candidate list.

use listscout_shared::{Candidate, TaskResult};
use serde::Serialize;

use crate::plan::ResearchPlan;

/// Candidate count contributed by one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub candidates: usize,
}

/// All candidates of a run, ready for deduplication.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregated {
    pub candidates: Vec<Candidate>,
    pub per_category: Vec<CategoryCount>,
}

/// Concatenate the candidates of successful tasks.
///
/// Categories follow plan order and candidates keep the order the provider
/// returned them in, so the result does not depend on which task finished
/// first. Results for categories missing from the plan go last.
pub fn aggregate(plan: &ResearchPlan, results: &[TaskResult]) -> Aggregated {
    let rank = |category: &str| {
        plan.categories
            .iter()
            .position(|c| c.category == category)
            .unwrap_or(usize::MAX)
    };

    let mut ordered: Vec<&TaskResult> = results.iter().filter(|r| r.outcome.is_success()).collect();
    // Stable sort keeps input order among unknown categories.
    ordered.sort_by_key(|r| rank(&r.category));

    let mut aggregated = Aggregated::default();
    for result in ordered {
        aggregated.per_category.push(CategoryCount {
            category: result.category.clone(),
            candidates: result.candidates.len(),
        });
        aggregated.candidates.extend(result.candidates.iter().cloned());
    }
    aggregated
}
