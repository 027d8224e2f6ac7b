//! Error types for listscout.
//!
//! Library crates use [`ListScoutError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all listscout operations.
#[derive(Debug, thiserror::Error)]
pub enum ListScoutError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while loading inputs or validating links.
    #[error("network error: {0}")]
    Network(String),

    /// Markdown or JSON parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad plan, invalid URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Research or embedding provider failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ListScoutError>;

impl ListScoutError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of a call to an external research or embedding provider.
///
/// Whether a variant is worth retrying is decided by the retry executor's
/// classifier, not here.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 429 or an equivalent provider signal.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx-class service unavailability.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Connection reset, DNS failure and similar transport problems.
    #[error("network failure: {0}")]
    Network(String),

    /// The request did not complete within the provider timeout.
    #[error("request timed out")]
    Timeout,

    /// Missing or rejected credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The provider rejected the request as malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The run budget refused to admit the call, so it was never sent.
    #[error("budget refused the call: {0}")]
    BudgetRefused(String),

    /// The provider answered but the payload could not be understood.
    /// Tokens were still consumed, so the cost is carried along.
    #[error("malformed response: {message}")]
    MalformedResponse { message: String, cost_usd: f64 },
}

impl ProviderError {
    /// Spend incurred by the failed call, if the provider reported any.
    pub fn cost_usd(&self) -> f64 {
        match self {
            Self::MalformedResponse { cost_usd, .. } => *cost_usd,
            _ => 0.0,
        }
    }
}
