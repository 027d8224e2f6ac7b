//! Shared types, error model, and configuration for listscout.
//!
//! This crate is the foundation depended on by all other listscout crates.
//! It provides:
//! - [`ListScoutError`] and [`ProviderError`]: the unified error types
//! - Domain types ([`Candidate`], [`OriginalEntry`], [`TaskResult`], [`RunId`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BudgetConfig, DedupConfig, MAX_WALL_TIME_SECS, OutputConfig, PlanConfig,
    ProviderConfig, RetryConfig, SchedulerConfig, ValidationConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{ListScoutError, ProviderError, Result};
pub use types::{
    CancelReason, Candidate, MatchLayerKind, OriginalEntry, RunId, RunStatus, TaskOutcome,
    TaskResult,
};
