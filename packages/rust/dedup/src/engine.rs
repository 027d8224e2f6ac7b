//! Sequential multi-layer deduplication against originals and the in-run
//! accepted set.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use listscout_shared::{Candidate, DedupConfig, MatchLayerKind, OriginalEntry, ProviderError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::layers::{MatchKey, MatchLayer, Thresholds, is_dense_category};

// ---------------------------------------------------------------------------
// EmbeddingProvider
// ---------------------------------------------------------------------------

/// Texts sent to the embedding provider in one call.
const EMBED_BATCH_SIZE: usize = 128;

/// Vectors for one batch of texts and what the call cost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingBatch {
    /// One vector per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

/// Source of embedding vectors for the semantic layer.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed every text of `texts` in a single call.
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError>;

    /// Model name used for cost projection.
    fn model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Decisions & stats
// ---------------------------------------------------------------------------

/// The entry a rejected candidate matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "set", content = "index", rename_all = "snake_case")]
pub enum MatchRef {
    /// Index into the original entries.
    Original(usize),
    /// Index into the accepted candidates of this run.
    Accepted(usize),
}

/// Verdict for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupDecision {
    pub candidate: Candidate,
    pub accepted: bool,
    pub rejecting_layer: Option<MatchLayerKind>,
    pub matched_against: Option<MatchRef>,
}

/// Aggregate counts for one dedup pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_candidates: usize,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub per_layer_rejections: BTreeMap<MatchLayerKind, usize>,
    /// `rejected_count / total_candidates`, 0 for an empty input.
    pub duplicate_ratio: f64,
    /// Set when `duplicate_ratio` exceeds the configured limit.
    pub high_duplication: bool,
    /// Candidates for which the semantic layer was skipped after a failed
    /// embedding call.
    pub embedding_failures: usize,
    /// Candidates for which the semantic layer was skipped because the run
    /// budget refused the embedding call.
    pub semantic_budget_skips: usize,
}

/// Result of [`DedupEngine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct DedupOutcome {
    /// One decision per input candidate, in input order.
    pub decisions: Vec<DedupDecision>,
    /// Accepted candidates, in input order.
    pub accepted: Vec<Candidate>,
    pub stats: DedupStats,
}

impl DedupOutcome {
    /// SHA-256 over the accepted set and the layer counts, as lower-case hex.
    /// Two runs over identical input produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for c in &self.accepted {
            for field in [&c.category, &c.title, &c.url, &c.description, &c.source_tag] {
                hasher.update(field.as_bytes());
                hasher.update([0u8]);
            }
        }
        hasher.update(self.stats.total_candidates.to_le_bytes());
        hasher.update(self.stats.accepted_count.to_le_bytes());
        for (layer, count) in &self.stats.per_layer_rejections {
            hasher.update(layer.as_str().as_bytes());
            hasher.update(count.to_le_bytes());
        }
        hasher.update(self.stats.duplicate_ratio.to_bits().to_le_bytes());

        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// DedupEngine
// ---------------------------------------------------------------------------

/// Applies the configured match layers to a candidate sequence.
///
/// Candidates are processed strictly in input order. Each one is compared
/// layer by layer (first match wins) against the originals and every
/// candidate accepted before it.
pub struct DedupEngine {
    general: Vec<MatchLayer>,
    dense: Vec<MatchLayer>,
    dense_keywords: Vec<String>,
    high_duplication_ratio: f64,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl DedupEngine {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            general: MatchLayer::ordered(&config.layers, Thresholds::general(config)),
            dense: MatchLayer::ordered(&config.layers, Thresholds::dense(config)),
            dense_keywords: config.dense_category_keywords.clone(),
            high_duplication_ratio: config.high_duplication_ratio,
            embedder: None,
        }
    }

    /// Enable the semantic layer. Without an embedder it never matches.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Layers applied to candidates of `category`.
    pub fn layers_for(&self, category: &str) -> &[MatchLayer] {
        if is_dense_category(category, &self.dense_keywords) {
            &self.dense
        } else {
            &self.general
        }
    }

    #[instrument(skip_all, fields(originals = originals.len(), candidates = candidates.len()))]
    pub async fn run(&self, originals: &[OriginalEntry], candidates: &[Candidate]) -> DedupOutcome {
        let mut original_keys: Vec<MatchKey> = originals
            .iter()
            .map(|o| MatchKey::new(&o.title, &o.url, &o.description))
            .collect();
        let mut candidate_keys: Vec<MatchKey> = candidates
            .iter()
            .map(|c| MatchKey::new(&c.title, &c.url, &c.description))
            .collect();
        let mut accepted_keys: Vec<MatchKey> = Vec::new();
        let mut accepted: Vec<Candidate> = Vec::new();
        let mut decisions = Vec::with_capacity(candidates.len());

        let mut per_layer_rejections: BTreeMap<MatchLayerKind, usize> =
            MatchLayerKind::default_order()
                .into_iter()
                .map(|kind| (kind, 0))
                .collect();
        let mut embedding_failures = 0usize;
        let mut semantic_budget_skips = 0usize;
        let mut embedded = false;

        for (index, candidate) in candidates.iter().enumerate() {
            let mut verdict = None;

            for layer in self.layers_for(&candidate.category) {
                if matches!(layer, MatchLayer::Semantic(_)) {
                    let Some(embedder) = self.embedder.as_deref() else {
                        continue;
                    };
                    // Embedded once, when the first candidate gets this far.
                    if !embedded {
                        embedded = true;
                        embed_pending(
                            embedder,
                            original_keys
                                .iter_mut()
                                .chain(candidate_keys[index..].iter_mut()),
                        )
                        .await;
                    }
                    let probe = &candidate_keys[index];
                    if probe.embedding.is_none() {
                        if probe.embedding_refused {
                            semantic_budget_skips += 1;
                        } else {
                            embedding_failures += 1;
                        }
                        continue;
                    }
                }

                let probe = &candidate_keys[index];
                if let Some(found) = find_match(layer, probe, &original_keys, &accepted_keys) {
                    verdict = Some((layer.kind(), found));
                    break;
                }
            }

            match verdict {
                Some((layer, found)) => {
                    debug!(
                        title = %candidate.title,
                        url = %candidate.url,
                        layer = %layer,
                        matched = ?found,
                        "candidate rejected"
                    );
                    *per_layer_rejections.entry(layer).or_insert(0) += 1;
                    decisions.push(DedupDecision {
                        candidate: candidate.clone(),
                        accepted: false,
                        rejecting_layer: Some(layer),
                        matched_against: Some(found),
                    });
                }
                None => {
                    accepted_keys.push(candidate_keys[index].clone());
                    accepted.push(candidate.clone());
                    decisions.push(DedupDecision {
                        candidate: candidate.clone(),
                        accepted: true,
                        rejecting_layer: None,
                        matched_against: None,
                    });
                }
            }
        }

        let total_candidates = candidates.len();
        let accepted_count = accepted.len();
        let rejected_count = total_candidates - accepted_count;
        let duplicate_ratio = if total_candidates == 0 {
            0.0
        } else {
            rejected_count as f64 / total_candidates as f64
        };
        let high_duplication = duplicate_ratio > self.high_duplication_ratio;

        if high_duplication {
            warn!(
                duplicate_ratio,
                limit = self.high_duplication_ratio,
                "high duplication: research queries may be overlapping the original list"
            );
        }
        info!(
            total = total_candidates,
            accepted = accepted_count,
            rejected = rejected_count,
            duplicate_ratio,
            "deduplication complete"
        );

        DedupOutcome {
            decisions,
            accepted,
            stats: DedupStats {
                total_candidates,
                accepted_count,
                rejected_count,
                per_layer_rejections,
                duplicate_ratio,
                high_duplication,
                embedding_failures,
                semantic_budget_skips,
            },
        }
    }
}

/// Embed every key that has no vector yet, in batches.
///
/// Keys of a failed batch are marked failed. Once the budget refuses a batch,
/// that batch and every later one are marked refused without calling out.
async fn embed_pending<'a>(
    embedder: &dyn EmbeddingProvider,
    keys: impl Iterator<Item = &'a mut MatchKey>,
) {
    let mut pending: Vec<&mut MatchKey> = Vec::new();
    for key in keys {
        if key.embedding.is_some() || key.embedding_failed || key.embedding_refused {
            continue;
        }
        if key.embed_text.is_empty() {
            key.embedding_failed = true;
            continue;
        }
        pending.push(key);
    }

    let mut refused = false;
    for chunk in pending.chunks_mut(EMBED_BATCH_SIZE) {
        if refused {
            chunk.iter_mut().for_each(|key| key.embedding_refused = true);
            continue;
        }

        let texts: Vec<String> = chunk.iter().map(|key| key.embed_text.clone()).collect();
        match embedder.embed_batch(&texts).await {
            Ok(batch) if batch.vectors.len() == texts.len() => {
                for (key, vector) in chunk.iter_mut().zip(batch.vectors) {
                    key.embedding = Some(vector);
                }
                debug!(texts = texts.len(), cost_usd = batch.cost_usd, "embedded batch");
            }
            Ok(batch) => {
                warn!(
                    expected = texts.len(),
                    returned = batch.vectors.len(),
                    "embedding batch size mismatch, skipping semantic layer for its texts"
                );
                chunk.iter_mut().for_each(|key| key.embedding_failed = true);
            }
            Err(ProviderError::BudgetRefused(reason)) => {
                warn!(%reason, "budget refused embeddings, skipping semantic layer");
                refused = true;
                chunk.iter_mut().for_each(|key| key.embedding_refused = true);
            }
            Err(e) => {
                warn!(texts = texts.len(), error = %e, "embedding failed, skipping semantic layer for its texts");
                chunk.iter_mut().for_each(|key| key.embedding_failed = true);
            }
        }
    }
}

fn find_match(
    layer: &MatchLayer,
    probe: &MatchKey,
    originals: &[MatchKey],
    accepted: &[MatchKey],
) -> Option<MatchRef> {
    if let Some(i) = originals.iter().position(|r| layer.matches(probe, r)) {
        return Some(MatchRef::Original(i));
    }
    accepted
        .iter()
        .position(|r| layer.matches(probe, r))
        .map(MatchRef::Accepted)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    fn original(title: &str, url: &str) -> OriginalEntry {
        OriginalEntry {
            category: "Tools".into(),
            title: title.into(),
            url: url.into(),
            description: String::new(),
        }
    }

    fn candidate(category: &str, title: &str, url: &str) -> Candidate {
        Candidate {
            category: category.into(),
            title: title.into(),
            url: url.into(),
            description: String::new(),
            source_tag: "test".into(),
        }
    }

    fn engine() -> DedupEngine {
        DedupEngine::new(&DedupConfig::default())
    }

    /// Looks up vectors by exact embed text; a batch with unknown text fails.
    /// Records the size of every batch it is asked for.
    struct TableEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        batches: Mutex<Vec<usize>>,
    }

    impl TableEmbedder {
        fn new(vectors: HashMap<String, Vec<f32>>) -> Self {
            Self {
                vectors,
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for TableEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
            self.batches.lock().unwrap().push(texts.len());
            let vectors = texts
                .iter()
                .map(|text| {
                    self.vectors
                        .get(text)
                        .cloned()
                        .ok_or_else(|| ProviderError::Unavailable(format!("no vector for {text}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(EmbeddingBatch {
                vectors,
                tokens_used: texts.len() as u64,
                cost_usd: 0.0,
            })
        }

        fn model(&self) -> &str {
            "text-embedding-3-small"
        }
    }

    struct RefusingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for RefusingEmbedder {
        async fn embed_batch(&self, _texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
            Err(ProviderError::BudgetRefused("admission closed".into()))
        }

        fn model(&self) -> &str {
            "text-embedding-3-small"
        }
    }

    #[tokio::test]
    async fn case_insensitive_title_is_rejected_at_title_layer() {
        let originals = [original("React", "https://reactjs.org")];
        let candidates = [candidate("Tools", "react", "https://react.dev")];

        let out = engine().run(&originals, &candidates).await;
        let d = &out.decisions[0];
        assert!(!d.accepted);
        assert_eq!(d.rejecting_layer, Some(MatchLayerKind::Title));
        assert_eq!(d.matched_against, Some(MatchRef::Original(0)));
    }

    #[tokio::test]
    async fn near_title_is_rejected_at_edit_distance_layer() {
        let originals = [original("React.js", "https://reactjs.org")];
        let candidates = [candidate("Tools", "ReactJS", "https://react.dev")];

        let out = engine().run(&originals, &candidates).await;
        assert_eq!(
            out.decisions[0].rejecting_layer,
            Some(MatchLayerKind::EditDistance)
        );
    }

    #[tokio::test]
    async fn dense_categories_use_stricter_edit_distance() {
        let originals = [original("webpack", "https://webpack.js.org")];

        let general = [candidate("Tools", "webpack 5", "https://example.com/wp5")];
        let out = engine().run(&originals, &general).await;
        assert_eq!(
            out.decisions[0].rejecting_layer,
            Some(MatchLayerKind::EditDistance)
        );

        let video = [candidate("Video Tutorials", "webpack 5", "https://example.com/wp5")];
        let out = engine().run(&originals, &video).await;
        assert!(out.decisions[0].accepted);
    }

    #[tokio::test]
    async fn canonical_url_is_rejected_at_url_layer() {
        let originals = [original("Example Tool", "https://example.com/tool")];
        let candidates = [candidate("Tools", "Totally Different", "http://example.com/tool/")];

        let out = engine().run(&originals, &candidates).await;
        assert_eq!(
            out.decisions[0].rejecting_layer,
            Some(MatchLayerKind::CanonicalUrl)
        );
    }

    #[tokio::test]
    async fn semantic_threshold_decides_rejection() {
        let originals = [original("Alpha", "https://alpha.dev")];
        let candidates = [
            candidate("Tools", "Quasar Player", "https://quasar.io"),
            candidate("Tools", "Meridian Suite", "https://meridian.app"),
        ];
        let embedder = Arc::new(TableEmbedder::new(HashMap::from([
            ("Alpha".to_string(), vec![1.0, 0.0]),
            ("Quasar Player".to_string(), vec![0.9, 0.435_889_9]),
            ("Meridian Suite".to_string(), vec![0.8, 0.6]),
        ])));

        let out = engine()
            .with_embedder(embedder.clone())
            .run(&originals, &candidates)
            .await;

        assert_eq!(
            out.decisions[0].rejecting_layer,
            Some(MatchLayerKind::Semantic)
        );
        assert!(out.decisions[1].accepted);
        assert_eq!(out.stats.embedding_failures, 0);
        // Originals and candidates go out together in one call.
        assert_eq!(*embedder.batches.lock().unwrap(), [3]);
    }

    #[tokio::test]
    async fn candidates_rejected_before_the_semantic_layer_are_not_embedded() {
        let originals = [original("Alpha", "https://alpha.dev")];
        let candidates = [
            candidate("Tools", "alpha", "https://alpha.io"),
            candidate("Tools", "Meridian Suite", "https://meridian.app"),
        ];
        let embedder = Arc::new(TableEmbedder::new(HashMap::from([
            ("Alpha".to_string(), vec![1.0, 0.0]),
            ("Meridian Suite".to_string(), vec![0.8, 0.6]),
        ])));

        let out = engine()
            .with_embedder(embedder.clone())
            .run(&originals, &candidates)
            .await;

        assert_eq!(out.decisions[0].rejecting_layer, Some(MatchLayerKind::Title));
        assert!(out.decisions[1].accepted);
        assert_eq!(*embedder.batches.lock().unwrap(), [2]);
    }

    #[tokio::test]
    async fn budget_refusal_skips_semantic_layer_and_is_counted() {
        let originals = [original("Alpha", "https://alpha.dev")];
        let candidates = [
            candidate("Tools", "Quasar Player", "https://quasar.io"),
            candidate("Tools", "Meridian Suite", "https://meridian.app"),
        ];

        let out = engine()
            .with_embedder(Arc::new(RefusingEmbedder))
            .run(&originals, &candidates)
            .await;

        assert_eq!(out.stats.accepted_count, 2);
        assert_eq!(out.stats.semantic_budget_skips, 2);
        assert_eq!(out.stats.embedding_failures, 0);
    }

    #[tokio::test]
    async fn embedding_failure_skips_semantic_layer() {
        let originals = [original("Alpha", "https://alpha.dev")];
        let candidates = [candidate("Tools", "Quasar Player", "https://quasar.io")];

        let out = engine()
            .with_embedder(Arc::new(TableEmbedder::new(HashMap::new())))
            .run(&originals, &candidates)
            .await;

        assert!(out.decisions[0].accepted);
        assert_eq!(out.stats.embedding_failures, 1);
    }

    #[tokio::test]
    async fn accepted_candidates_join_comparison_set() {
        let candidates = [
            candidate("Tools", "ripgrep", "https://github.com/BurntSushi/ripgrep"),
            candidate("CLI", "Ripgrep", "https://crates.io/crates/ripgrep"),
        ];

        let out = engine().run(&[], &candidates).await;
        assert!(out.decisions[0].accepted);
        assert_eq!(
            out.decisions[1].matched_against,
            Some(MatchRef::Accepted(0))
        );
        assert_eq!(out.accepted.len(), 1);
    }

    #[tokio::test]
    async fn every_candidate_gets_one_decision_and_stats_add_up() {
        let originals = [
            original("React", "https://reactjs.org"),
            original("Vue", "https://vuejs.org"),
        ];
        let candidates = [
            candidate("Tools", "react", "https://react.dev"),
            candidate("Tools", "Svelte", "https://svelte.dev"),
            candidate("Tools", "Vue.js docs", "https://vuejs.org/"),
            candidate("Tools", "Solid", "https://solidjs.com"),
        ];

        let out = engine().run(&originals, &candidates).await;
        assert_eq!(out.decisions.len(), candidates.len());
        assert_eq!(out.stats.total_candidates, 4);
        assert_eq!(out.stats.accepted_count, 2);
        assert_eq!(out.stats.rejected_count, 2);
        let layer_total: usize = out.stats.per_layer_rejections.values().sum();
        assert_eq!(layer_total, out.stats.rejected_count);
        assert!((out.stats.duplicate_ratio - 0.5).abs() < 1e-12);
        assert!(out.stats.high_duplication);
    }

    #[tokio::test]
    async fn low_duplication_is_not_flagged() {
        let originals = [original("React", "https://reactjs.org")];
        let candidates = [
            candidate("Tools", "Svelte", "https://svelte.dev"),
            candidate("Tools", "Solid", "https://solidjs.com"),
            candidate("Tools", "Qwik", "https://qwik.dev"),
            candidate("Tools", "Lit", "https://lit.dev"),
        ];

        let out = engine().run(&originals, &candidates).await;
        assert_eq!(out.stats.duplicate_ratio, 0.0);
        assert!(!out.stats.high_duplication);
    }

    #[tokio::test]
    async fn accepted_urls_never_overlap_originals() {
        let originals = [
            original("Serde", "https://serde.rs/"),
            original("Tokio", "https://tokio.rs"),
        ];
        let candidates = [
            candidate("Tools", "Serialization framework", "http://www.serde.rs"),
            candidate("Tools", "Async runtime", "https://TOKIO.rs/?utm_source=newsletter"),
            candidate("Tools", "Axum", "https://github.com/tokio-rs/axum"),
        ];

        let out = engine().run(&originals, &candidates).await;
        let original_urls: Vec<String> = originals
            .iter()
            .map(|o| crate::canonical_url(&o.url))
            .collect();
        for c in &out.accepted {
            assert!(!original_urls.contains(&crate::canonical_url(&c.url)));
        }
        assert_eq!(out.accepted.len(), 1);
    }

    #[tokio::test]
    async fn rerun_against_accepted_set_accepts_nothing() {
        let candidates = [
            candidate("Tools", "Svelte", "https://svelte.dev"),
            candidate("Tools", "Solid", "https://solidjs.com"),
            candidate("Tools", "Solid", "https://www.solidjs.com"),
        ];
        let first = engine().run(&[], &candidates).await;

        let as_originals: Vec<OriginalEntry> = first
            .accepted
            .iter()
            .map(|c| OriginalEntry {
                category: c.category.clone(),
                title: c.title.clone(),
                url: c.url.clone(),
                description: c.description.clone(),
            })
            .collect();
        let second = engine().run(&as_originals, &first.accepted).await;
        assert!(second.accepted.is_empty());
    }

    #[tokio::test]
    async fn identical_input_gives_identical_output() {
        let originals = [original("React", "https://reactjs.org")];
        let candidates = [
            candidate("Tools", "react", "https://react.dev"),
            candidate("Tools", "Svelte", "https://svelte.dev"),
        ];

        let a = engine().run(&originals, &candidates).await;
        let b = engine().run(&originals, &candidates).await;
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.decisions, b.decisions);
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[tokio::test]
    async fn stats_serialize_with_layer_names() {
        let out = engine().run(&[], &[]).await;
        let json = serde_json::to_value(&out.stats).unwrap();
        assert_eq!(json["per_layer_rejections"]["canonical_url"], 0);
        assert_eq!(json["duplicate_ratio"], 0.0);
        assert_eq!(json["semantic_budget_skips"], 0);
    }
}
