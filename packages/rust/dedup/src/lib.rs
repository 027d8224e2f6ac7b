//! Multi-layer deduplication of research candidates.
//!
//! Each candidate is checked against the original list and against every
//! candidate accepted before it, layer by layer in configured order:
//!
//! 1. normalized title equality
//! 2. title edit distance
//! 3. canonical URL, or same host with a near-identical title
//! 4. embedding cosine similarity
//!
//! The first matching layer rejects the candidate. High-density categories
//! (by default anything mentioning "video") use stricter thresholds.

mod canonical;
mod engine;
mod layers;
mod similarity;

pub use canonical::{canonical_url, host};
pub use engine::{
    DedupDecision, DedupEngine, DedupOutcome, DedupStats, EmbeddingBatch, EmbeddingProvider,
    MatchRef,
};
pub use layers::{MatchKey, MatchLayer, Thresholds, is_dense_category};
pub use similarity::{cosine_similarity, levenshtein, normalize_title};
