//! Application configuration for listscout.
//!
//! User config lives at `~/.listscout/listscout.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ListScoutError, Result};
use crate::types::MatchLayerKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "listscout.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".listscout";

/// Longest accepted wall-time limit (one year).
pub const MAX_WALL_TIME_SECS: u64 = 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Config structs (matching listscout.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cost ceiling and wall-time limits.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Backoff policy for provider calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Category task scheduling.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Deduplication layers and thresholds.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Research and embedding provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Link validation after dedup.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Research plan derivation.
    #[serde(default)]
    pub plan: PlanConfig,

    /// Output location and reporting thresholds.
    #[serde(default)]
    pub output: OutputConfig,
}

/// `[budget]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum cumulative spend for a run, in USD.
    #[serde(default = "default_cost_ceiling")]
    pub cost_ceiling_usd: f64,

    /// Maximum elapsed time for a run, in seconds.
    #[serde(default = "default_wall_time")]
    pub wall_time_secs: u64,

    /// Fraction of the ceiling at which a spend warning is logged.
    #[serde(default = "default_warn_fraction")]
    pub warn_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cost_ceiling_usd: default_cost_ceiling(),
            wall_time_secs: default_wall_time(),
            warn_fraction: default_warn_fraction(),
        }
    }
}

fn default_cost_ceiling() -> f64 {
    10.0
}
fn default_wall_time() -> u64 {
    600
}
fn default_warn_fraction() -> f64 {
    0.8
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base; attempt `n` waits `base * 2^n`.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff sleep.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay (0.25 = ±25%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.25
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long in-flight tasks get to return after the deadline broadcast.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,

    /// Token volume assumed for a category when the plan does not say.
    #[serde(default = "default_expected_tokens")]
    pub default_expected_tokens: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: default_cancel_grace(),
            default_expected_tokens: default_expected_tokens(),
        }
    }
}

fn default_cancel_grace() -> u64 {
    2_000
}
fn default_expected_tokens() -> u64 {
    5_000
}

/// `[dedup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Layer evaluation order. Must include `canonical_url`.
    #[serde(default = "MatchLayerKind::default_order")]
    pub layers: Vec<MatchLayerKind>,

    /// Max Levenshtein distance for general categories.
    #[serde(default = "default_edit_distance")]
    pub edit_distance: usize,

    /// Max Levenshtein distance for high-density categories.
    #[serde(default = "default_dense_edit_distance")]
    pub dense_edit_distance: usize,

    /// Cosine similarity at or above which candidates are duplicates.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,

    /// Semantic threshold for high-density categories.
    #[serde(default = "default_dense_semantic_threshold")]
    pub dense_semantic_threshold: f32,

    /// Category name fragments (case-insensitive) marking high-density categories.
    #[serde(default = "default_dense_keywords")]
    pub dense_category_keywords: Vec<String>,

    /// Duplicate ratio above which a high-duplication warning is raised.
    #[serde(default = "default_high_duplication_ratio")]
    pub high_duplication_ratio: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            layers: MatchLayerKind::default_order(),
            edit_distance: default_edit_distance(),
            dense_edit_distance: default_dense_edit_distance(),
            semantic_threshold: default_semantic_threshold(),
            dense_semantic_threshold: default_dense_semantic_threshold(),
            dense_category_keywords: default_dense_keywords(),
            high_duplication_ratio: default_high_duplication_ratio(),
        }
    }
}

fn default_edit_distance() -> usize {
    2
}
fn default_dense_edit_distance() -> usize {
    1
}
fn default_semantic_threshold() -> f32 {
    0.85
}
fn default_dense_semantic_threshold() -> f32 {
    0.88
}
fn default_dense_keywords() -> Vec<String> {
    vec!["video".into()]
}
fn default_high_duplication_ratio() -> f64 {
    0.30
}

impl DedupConfig {
    /// Reject layer lists that could let an original URL through.
    pub fn validate(&self) -> Result<()> {
        if !self.layers.contains(&MatchLayerKind::CanonicalUrl) {
            return Err(ListScoutError::config(
                "dedup.layers must include canonical_url",
            ));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if self.layers[..i].contains(layer) {
                return Err(ListScoutError::config(format!(
                    "dedup.layers lists {layer} more than once"
                )));
            }
        }
        for (name, value) in [
            ("semantic_threshold", self.semantic_threshold),
            ("dense_semantic_threshold", self.dense_semantic_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ListScoutError::config(format!(
                    "dedup.{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.high_duplication_ratio) {
            return Err(ListScoutError::config(format!(
                "dedup.high_duplication_ratio must be within 0.0..=1.0, got {}",
                self.high_duplication_ratio
            )));
        }
        Ok(())
    }
}

/// `[provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used by category research workers.
    #[serde(default = "default_research_model")]
    pub research_model: String,

    /// Model used for semantic dedup embeddings.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            research_model: default_research_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_research_model() -> String {
    "gpt-4o".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_provider_timeout() -> u64 {
    120
}

/// `[validation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Whether accepted links are checked before reporting.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-link timeout in seconds.
    #[serde(default = "default_validation_timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrent link checks.
    #[serde(default = "default_validation_concurrency")]
    pub concurrency: usize,

    /// Descriptions longer than this are truncated.
    #[serde(default = "default_max_description_len")]
    pub max_description_len: usize,

    /// Reject plain-http links.
    #[serde(default = "default_true")]
    pub require_https: bool,

    /// GitHub repositories with fewer stars are rejected. Unset disables the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_github_stars: Option<u64>,

    /// Base URL of the GitHub REST API.
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,

    /// Env var holding an optional GitHub token for the star check.
    #[serde(default = "default_github_token_env")]
    pub github_token_env: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_validation_timeout(),
            concurrency: default_validation_concurrency(),
            max_description_len: default_max_description_len(),
            require_https: true,
            min_github_stars: None,
            github_api_url: default_github_api_url(),
            github_token_env: default_github_token_env(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_validation_timeout() -> u64 {
    3
}
fn default_validation_concurrency() -> usize {
    8
}
fn default_max_description_len() -> usize {
    100
}
fn default_github_api_url() -> String {
    "https://api.github.com".into()
}
fn default_github_token_env() -> String {
    "GITHUB_TOKEN".into()
}

/// `[plan]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Sections of the original list that are never researched.
    #[serde(default = "default_skip_sections")]
    pub skip_sections: Vec<String>,

    /// Search queries researched per category of a derived plan.
    #[serde(default = "default_queries_per_category")]
    pub queries_per_category: usize,

    /// Seed for the query shuffle. Unset shuffles differently on every run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            skip_sections: default_skip_sections(),
            queries_per_category: default_queries_per_category(),
            seed: None,
        }
    }
}

fn default_queries_per_category() -> usize {
    3
}

fn default_skip_sections() -> Vec<String> {
    vec!["Contents".into(), "Contributing".into(), "License".into()]
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root directory for per-run output folders.
    #[serde(default = "default_output_dir")]
    pub dir: String,

    /// Fewer surviving links than this triggers a warning.
    #[serde(default = "default_min_new_links")]
    pub min_new_links: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            min_new_links: default_min_new_links(),
        }
    }
}

fn default_output_dir() -> String {
    "runs".into()
}
fn default_min_new_links() -> usize {
    10
}

impl AppConfig {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        let ceiling = self.budget.cost_ceiling_usd;
        if ceiling.is_nan() || ceiling <= 0.0 {
            return Err(ListScoutError::config(
                "budget.cost_ceiling_usd must be positive",
            ));
        }
        let wall_time = self.budget.wall_time_secs;
        if wall_time == 0 || wall_time > MAX_WALL_TIME_SECS {
            return Err(ListScoutError::config(format!(
                "budget.wall_time_secs must be within 1..={MAX_WALL_TIME_SECS}, got {wall_time}"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ListScoutError::config("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ListScoutError::config("retry.jitter must be within 0.0..=1.0"));
        }
        if self.validation.concurrency == 0 {
            return Err(ListScoutError::config(
                "validation.concurrency must be at least 1",
            ));
        }
        if self.plan.queries_per_category == 0 {
            return Err(ListScoutError::config(
                "plan.queries_per_category must be at least 1",
            ));
        }
        self.dedup.validate()
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.listscout/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ListScoutError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.listscout/listscout.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ListScoutError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ListScoutError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ListScoutError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ListScoutError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ListScoutError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the provider API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.provider.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ListScoutError::config(format!(
            "provider API key not found. Set the {var_name} environment variable."
        ))),
    }
}
