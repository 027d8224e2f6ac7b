//! Spend and wall-time accounting for research runs.
//!
//! - [`BudgetTracker`]: admission control over a joint cost ceiling and
//!   wall-clock limit, shared by every worker of a run
//! - [`RetryExecutor`]: classification-aware exponential backoff around
//!   provider calls
//! - [`ModelPricing`]: per-model token prices used to project task cost

mod pricing;
mod retry;
mod tracker;

pub use pricing::{ModelPricing, estimate_tokens};
pub use retry::{Attempted, Classify, ErrorClass, RetryExecutor, RetryPolicy};
pub use tracker::{AdmissionError, BudgetTracker, CostReport, Reservation};
