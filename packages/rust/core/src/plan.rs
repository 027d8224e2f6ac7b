//! Research plans: which categories to research and with what queries.
//!
//! A plan is either written by hand as TOML or derived from the sections of
//! the original list:
//!
//! ```toml
//! title = "Awesome Rust"
//!
//! [[categories]]
//! category = "Testing"
//! queries = ["rust test runners", "property testing rust"]
//! expected_tokens = 8000
//! ```
//!
//! A single `query = "..."` string is accepted in place of `queries`.

use std::collections::HashSet;
use std::path::Path;

use listscout_budget::ModelPricing;
use listscout_providers::OriginalList;
use listscout_shared::{ListScoutError, OriginalEntry, PlanConfig, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Existing entries of a section turned into "alternatives" queries.
const MAX_ITEM_QUERIES: usize = 3;

/// One category to research.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPlan {
    pub category: String,
    /// Researched in order, all under the category's one reservation.
    #[serde(alias = "query", deserialize_with = "one_or_many")]
    pub queries: Vec<String>,
    /// Tokens expected per query; the scheduler default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_tokens: Option<u64>,
}

impl CategoryPlan {
    pub fn new(category: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            queries: vec![query.into()],
            expected_tokens: None,
        }
    }

    pub fn tokens_or(&self, default_tokens: u64) -> u64 {
        self.expected_tokens.unwrap_or(default_tokens)
    }

    /// Tokens expected across every query of the category.
    pub fn total_tokens(&self, default_tokens: u64) -> u64 {
        self.tokens_or(default_tokens)
            .saturating_mul(self.queries.len().max(1) as u64)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(query) => vec![query],
        OneOrMany::Many(queries) => queries,
    })
}

/// Ordered list of categories for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub categories: Vec<CategoryPlan>,
}

/// Projected spend of a plan, per category and in total.
#[derive(Debug, Clone, Serialize)]
pub struct PlanEstimate {
    pub model: String,
    pub categories: Vec<CategoryEstimate>,
    pub total_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryEstimate {
    pub category: String,
    pub expected_tokens: u64,
    pub projected_usd: f64,
}

impl ResearchPlan {
    /// Read a plan from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ListScoutError::io(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let plan: Self = toml::from_str(content)
            .map_err(|e| ListScoutError::parse(format!("invalid research plan: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    /// One category per non-empty section of `list`, minus skipped sections.
    ///
    /// Each category gets up to `queries_per_category` queries. The first is
    /// always `"<section> <topic>"`; the rest are drawn from the expanded
    /// terms in an order shuffled by `config.seed`.
    pub fn from_original(list: &OriginalList, config: &PlanConfig) -> Self {
        let topic = list.topic();
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut categories = Vec::new();
        for section in &list.sections {
            if config
                .skip_sections
                .iter()
                .any(|skip| skip.eq_ignore_ascii_case(section))
            {
                continue;
            }
            let items: Vec<&OriginalEntry> = list
                .entries
                .iter()
                .filter(|e| &e.category == section)
                .collect();
            if items.is_empty() {
                continue;
            }

            let mut terms = expand_terms(section, topic, &items);
            let primary = terms.remove(0);
            terms.shuffle(&mut rng);
            terms.truncate(config.queries_per_category.saturating_sub(1));
            terms.insert(0, primary);

            categories.push(CategoryPlan {
                category: section.clone(),
                queries: terms,
                expected_tokens: None,
            });
        }

        debug!(
            sections = list.sections.len(),
            categories = categories.len(),
            queries = categories.iter().map(|c| c.queries.len()).sum::<usize>(),
            "derived plan from original list"
        );
        Self {
            title: list.title.clone(),
            categories,
        }
    }

    /// Keep only the named categories (case-insensitive). An empty filter
    /// keeps everything.
    pub fn retain_categories(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.categories
            .retain(|c| names.iter().any(|n| n.eq_ignore_ascii_case(&c.category)));
    }

    /// Reject empty plans, blank fields, and repeated categories.
    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            return Err(ListScoutError::validation("research plan has no categories"));
        }
        let mut seen = HashSet::new();
        for entry in &self.categories {
            if entry.category.trim().is_empty() {
                return Err(ListScoutError::validation("plan category name is empty"));
            }
            if entry.queries.is_empty() {
                return Err(ListScoutError::validation(format!(
                    "plan category '{}' has no queries",
                    entry.category
                )));
            }
            if entry.queries.iter().any(|q| q.trim().is_empty()) {
                return Err(ListScoutError::validation(format!(
                    "plan category '{}' has an empty query",
                    entry.category
                )));
            }
            if !seen.insert(entry.category.to_lowercase()) {
                return Err(ListScoutError::validation(format!(
                    "plan category '{}' appears more than once",
                    entry.category
                )));
            }
        }
        Ok(())
    }

    /// Projected cost of every category at `model`'s price.
    pub fn estimate(&self, model: &str, default_tokens: u64) -> PlanEstimate {
        let pricing = ModelPricing::for_model(model);
        let categories: Vec<CategoryEstimate> = self
            .categories
            .iter()
            .map(|c| {
                let expected_tokens = c.total_tokens(default_tokens);
                CategoryEstimate {
                    category: c.category.clone(),
                    expected_tokens,
                    projected_usd: pricing.estimate_usd(expected_tokens),
                }
            })
            .collect();
        PlanEstimate {
            model: model.to_string(),
            total_usd: categories.iter().map(|c| c.projected_usd).sum(),
            categories,
        }
    }
}

/// Search terms for one section, each carrying the list topic. The plain
/// section term comes first.
fn expand_terms(section: &str, topic: &str, items: &[&OriginalEntry]) -> Vec<String> {
    let mut raw = vec![
        section.to_string(),
        format!("best {section} libraries and tools"),
        format!("new {section} projects"),
    ];
    raw.extend(
        items
            .iter()
            .take(MAX_ITEM_QUERIES)
            .map(|item| format!("{} alternatives", item.title)),
    );

    let topic_lower = topic.to_lowercase();
    let mut terms: Vec<String> = Vec::with_capacity(raw.len());
    for term in raw {
        let term = if topic.is_empty() || term.to_lowercase().contains(&topic_lower) {
            term
        } else {
            format!("{term} {topic}")
        };
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(&term)) {
            terms.push(term);
        }
    }
    terms
}
