//! The four match layers and the per-category thresholds that drive them.

use listscout_shared::{DedupConfig, MatchLayerKind};

use crate::canonical::{canonical_url, host};
use crate::similarity::{cosine_similarity, levenshtein, normalize_title};

// ---------------------------------------------------------------------------
// MatchKey
// ---------------------------------------------------------------------------

/// Precomputed comparison data for one original entry or candidate.
#[derive(Debug, Clone)]
pub struct MatchKey {
    pub title: String,
    pub canonical_url: String,
    pub host: Option<String>,
    /// Text sent to the embedding provider.
    pub embed_text: String,
    /// Filled when the semantic layer is first reached.
    pub embedding: Option<Vec<f32>>,
    /// Set after a failed embedding call so it is not repeated.
    pub embedding_failed: bool,
    /// Set when the run budget refused the embedding call.
    pub embedding_refused: bool,
}

impl MatchKey {
    pub fn new(title: &str, url: &str, description: &str) -> Self {
        let embed_text = format!("{} {}", title.trim(), description.trim())
            .trim()
            .to_string();
        Self {
            title: normalize_title(title),
            canonical_url: canonical_url(url),
            host: host(url),
            embed_text,
            embedding: None,
            embedding_failed: false,
            embedding_refused: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Numeric thresholds for one class of category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Maximum Levenshtein distance treated as the same title.
    pub edit_distance: usize,
    /// Minimum cosine similarity treated as the same resource.
    pub semantic: f32,
}

impl Thresholds {
    pub fn general(config: &DedupConfig) -> Self {
        Self {
            edit_distance: config.edit_distance,
            semantic: config.semantic_threshold,
        }
    }

    /// Stricter thresholds for high-density categories.
    pub fn dense(config: &DedupConfig) -> Self {
        Self {
            edit_distance: config.dense_edit_distance,
            semantic: config.dense_semantic_threshold,
        }
    }
}

/// True when the category name contains one of the configured keywords.
pub fn is_dense_category(category: &str, keywords: &[String]) -> bool {
    let category = category.to_lowercase();
    keywords
        .iter()
        .any(|kw| !kw.is_empty() && category.contains(&kw.to_lowercase()))
}

// ---------------------------------------------------------------------------
// MatchLayer
// ---------------------------------------------------------------------------

/// One configured matching rule.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchLayer {
    /// Case-insensitive equality of normalized titles.
    Title,
    /// Normalized titles within the given edit distance.
    EditDistance(usize),
    /// Equal canonical URLs, or equal hosts with titles within the given
    /// edit distance.
    CanonicalUrl(usize),
    /// Cosine similarity of embeddings at or above the threshold.
    Semantic(f32),
}

impl MatchLayer {
    pub fn from_kind(kind: MatchLayerKind, thresholds: Thresholds) -> Self {
        match kind {
            MatchLayerKind::Title => Self::Title,
            MatchLayerKind::EditDistance => Self::EditDistance(thresholds.edit_distance),
            MatchLayerKind::CanonicalUrl => Self::CanonicalUrl(thresholds.edit_distance),
            MatchLayerKind::Semantic => Self::Semantic(thresholds.semantic),
        }
    }

    /// Build the ordered layer list for one threshold class.
    pub fn ordered(kinds: &[MatchLayerKind], thresholds: Thresholds) -> Vec<Self> {
        kinds
            .iter()
            .map(|kind| Self::from_kind(*kind, thresholds))
            .collect()
    }

    pub fn kind(&self) -> MatchLayerKind {
        match self {
            Self::Title => MatchLayerKind::Title,
            Self::EditDistance(_) => MatchLayerKind::EditDistance,
            Self::CanonicalUrl(_) => MatchLayerKind::CanonicalUrl,
            Self::Semantic(_) => MatchLayerKind::Semantic,
        }
    }

    /// Whether `probe` duplicates `reference` under this layer.
    ///
    /// Empty titles never match on title rules. The semantic layer needs
    /// both embeddings to be present.
    pub fn matches(&self, probe: &MatchKey, reference: &MatchKey) -> bool {
        match self {
            Self::Title => !probe.title.is_empty() && probe.title == reference.title,
            Self::EditDistance(max) => titles_within(probe, reference, *max),
            Self::CanonicalUrl(max) => {
                if !probe.canonical_url.is_empty() && probe.canonical_url == reference.canonical_url
                {
                    return true;
                }
                match (&probe.host, &reference.host) {
                    (Some(a), Some(b)) if a == b => titles_within(probe, reference, *max),
                    _ => false,
                }
            }
            Self::Semantic(threshold) => match (&probe.embedding, &reference.embedding) {
                (Some(a), Some(b)) => cosine_similarity(a, b) >= *threshold,
                _ => false,
            },
        }
    }
}

fn titles_within(probe: &MatchKey, reference: &MatchKey, max: usize) -> bool {
    if probe.title.is_empty() || reference.title.is_empty() {
        return false;
    }
    // Lengths bound the distance from below.
    let (a, b) = (probe.title.chars().count(), reference.title.chars().count());
    if a.abs_diff(b) > max {
        return false;
    }
    levenshtein(&probe.title, &reference.title) <= max
}
