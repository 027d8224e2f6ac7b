//! Research run orchestration for listscout.
//!
//! Ties the budget, providers, and dedup engine together into one
//! end-to-end workflow ([`run_research`]):
//! plan → parallel research → aggregate → dedup → validate → report.

pub mod aggregator;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod scheduler;

pub use aggregator::{Aggregated, CategoryCount, aggregate};
pub use pipeline::{
    ProgressReporter, RunConfig, RunResult, SilentProgress, dedup_candidates, run_research,
};
pub use plan::{CategoryEstimate, CategoryPlan, PlanEstimate, ResearchPlan};
pub use report::{RunReport, TaskRecord, derive_status};
pub use scheduler::TaskScheduler;
