//! External collaborators of a research run.
//!
//! - [`ResearchProvider`]: per-category research calls, implemented over an
//!   OpenAI-compatible chat API by [`OpenAiResearcher`]
//! - [`OpenAiEmbedder`]: embeddings for the semantic dedup layer
//! - [`load_original`]: the curated list being extended, from JSON or
//!   awesome-list Markdown
//! - [`UrlValidator`]: concurrent liveness and GitHub star checks for
//!   accepted links

mod awesome;
mod openai;
mod original;
mod validator;

use std::time::Duration;

use async_trait::async_trait;
use listscout_shared::{Candidate, ListScoutError, OriginalEntry, ProviderError, Result};
use reqwest::Client;

pub use awesome::{AwesomeItem, AwesomeList, AwesomeSection, parse_awesome_markdown};
pub use openai::{OpenAiEmbedder, OpenAiResearcher};
pub use original::{OriginalList, load_original, raw_readme_urls};
pub use validator::{
    InvalidLink, UrlValidator, ValidationReport, ValidationSummary, truncate_description,
};

/// User-Agent string for outgoing requests.
const USER_AGENT: &str = concat!("listscout/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects followed by any client.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// ResearchProvider
// ---------------------------------------------------------------------------

/// What one research call produced.
#[derive(Debug, Clone, Default)]
pub struct ResearchOutput {
    pub candidates: Vec<Candidate>,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

/// One research call: a category, one of its queries, and what the list
/// already holds for it.
#[derive(Debug, Clone, Copy)]
pub struct ResearchRequest<'a> {
    pub category: &'a str,
    pub query: &'a str,
    /// Existing entries shown to the model as examples.
    pub examples: &'a [OriginalEntry],
    /// URLs the model is told not to propose again.
    pub exclude_urls: &'a [String],
}

impl<'a> ResearchRequest<'a> {
    pub fn new(category: &'a str, query: &'a str) -> Self {
        Self {
            category,
            query,
            examples: &[],
            exclude_urls: &[],
        }
    }
}

/// Finds candidate links for one category.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn research(
        &self,
        request: &ResearchRequest<'_>,
    ) -> std::result::Result<ResearchOutput, ProviderError>;

    /// Model name used for cost projection.
    fn model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a reqwest client with the shared defaults.
fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(timeout)
        .build()
        .map_err(|e| ListScoutError::Network(format!("failed to build HTTP client: {e}")))
}
