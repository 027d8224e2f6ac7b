//! Core domain types shared by the scheduler, dedup engine, and reports.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for research run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A link proposed by a research worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Category the worker was researching.
    pub category: String,
    /// Display title of the resource.
    pub title: String,
    /// Target URL as reported by the provider.
    pub url: String,
    /// Short description of the resource.
    #[serde(default)]
    pub description: String,
    /// Where the candidate came from (model or search backend).
    #[serde(default)]
    pub source_tag: String,
}

/// An entry of the curated list being extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalEntry {
    /// Section the entry is listed under.
    pub category: String,
    /// Display title.
    pub title: String,
    /// Target URL.
    pub url: String,
    /// Description text after the link, if any.
    #[serde(default)]
    pub description: String,
}

// ---------------------------------------------------------------------------
// Dedup layers
// ---------------------------------------------------------------------------

/// Identifies one of the dedup matching layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLayerKind {
    Title,
    EditDistance,
    CanonicalUrl,
    Semantic,
}

impl MatchLayerKind {
    /// Stable name used in logs and stats files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::EditDistance => "edit_distance",
            Self::CanonicalUrl => "canonical_url",
            Self::Semantic => "semantic",
        }
    }

    /// The default evaluation order, cheapest check first.
    pub fn default_order() -> Vec<Self> {
        vec![
            Self::Title,
            Self::EditDistance,
            Self::CanonicalUrl,
            Self::Semantic,
        ]
    }
}

impl std::fmt::Display for MatchLayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task outcomes
// ---------------------------------------------------------------------------

/// Why a category task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Admission refused: the projected cost did not fit the remaining budget.
    BudgetRefused,
    /// The wall-time deadline expired before the task finished.
    WallTime,
    /// The run was cancelled by an external shutdown request.
    Shutdown,
}

/// Terminal outcome of one category task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed { error: String },
    Cancelled { reason: CancelReason },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Record of one category task. Built once when the task reaches a terminal
/// state and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub category: String,
    /// Empty unless the task succeeded.
    pub candidates: Vec<Candidate>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub attempt_count: u32,
    pub outcome: TaskOutcome,
}

impl TaskResult {
    /// A task that never launched.
    pub fn cancelled(category: impl Into<String>, reason: CancelReason) -> Self {
        Self {
            category: category.into(),
            candidates: Vec::new(),
            tokens_used: 0,
            cost_usd: 0.0,
            attempt_count: 0,
            outcome: TaskOutcome::Cancelled { reason },
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Terminal status of a whole research run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every category succeeded.
    Completed,
    /// At least one category was refused admission or the ceiling was overshot.
    BudgetExceeded,
    /// The wall-time deadline cut the run short.
    WallTimeExceeded,
    /// At least one category failed after retries.
    PartialFailure,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::WallTimeExceeded => "wall_time_exceeded",
            Self::PartialFailure => "partial_failure",
        };
        f.write_str(s)
    }
}
