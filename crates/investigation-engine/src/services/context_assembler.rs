use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::embedding_index::{EmbeddingIndex, SearchHit};
use crate::config::RetrievalConfig;
use crate::utils::error::EngineResult;
use crate::utils::similarity::is_near_duplicate;
use crate::utils::token_estimator::{estimate_tokens, would_exceed_limit};

/// Upper bound on chunks handed to the next turn
pub const MAX_TOP_K: usize = 5;
pub const MIN_TOP_K: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub exchange_id: String,
    pub text: String,
    pub similarity: f32,
    pub recency: f32,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextMetrics {
    pub candidates: usize,
    pub deduplicated: usize,
    pub included: usize,
    pub total_tokens: usize,
    /// Stopped by the token budget rather than by top_k
    pub truncated: bool,
    /// Query embedding failed and the context was left empty
    pub embedding_failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub chunks: Vec<ContextChunk>,
    pub metrics: ContextMetrics,
}

impl AssembledContext {
    pub fn texts(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.text.clone()).collect()
    }
}

/// Turns a query into a ranked, deduplicated, token-budgeted list of prior exchanges.
pub struct ContextAssembler {
    index: Arc<EmbeddingIndex>,
    config: RetrievalConfig,
}

impl ContextAssembler {
    pub fn new(index: Arc<EmbeddingIndex>, config: RetrievalConfig) -> Self {
        Self { index, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Configured top_k, kept inside [MIN_TOP_K, MAX_TOP_K]
    pub fn default_top_k(&self) -> usize {
        self.config.top_k.clamp(MIN_TOP_K, MAX_TOP_K)
    }

    /// Chunk texts only. Empty when the session has nothing indexed or the
    /// query cannot be embedded.
    pub async fn get_context(
        &self,
        query_text: &str,
        session_id: &str,
        top_k: usize,
        max_tokens: usize,
    ) -> EngineResult<Vec<String>> {
        Ok(self
            .assemble_scored(query_text, session_id, top_k, max_tokens)
            .await?
            .texts())
    }

    pub async fn assemble_scored(
        &self,
        query_text: &str,
        session_id: &str,
        top_k: usize,
        max_tokens: usize,
    ) -> EngineResult<AssembledContext> {
        if self.index.len(session_id) == 0 || top_k == 0 {
            debug!("No prior exchanges for session {}, empty context", session_id);
            return Ok(AssembledContext::default());
        }

        let query_vector = match self.index.embed(query_text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "Query embedding failed for session {} ({:?}), continuing without context: {}",
                    session_id,
                    e.kind(),
                    e
                );
                return Ok(AssembledContext {
                    chunks: Vec::new(),
                    metrics: ContextMetrics {
                        embedding_failed: true,
                        ..Default::default()
                    },
                });
            }
        };

        self.assemble_with_vector(&query_vector, session_id, top_k, max_tokens)
    }

    /// Everything after the query embedding: over-fetch, score, dedup, budget.
    pub fn assemble_with_vector(
        &self,
        query_vector: &[f32],
        session_id: &str,
        top_k: usize,
        max_tokens: usize,
    ) -> EngineResult<AssembledContext> {
        let top_k = top_k.min(MAX_TOP_K);
        let fetch = top_k * self.config.overfetch_factor.max(1);
        let hits = self.index.search(query_vector, session_id, fetch)?;
        let bounds = self.index.session_bounds(session_id);

        let mut metrics = ContextMetrics {
            candidates: hits.len(),
            ..Default::default()
        };

        let mut scored: Vec<(ContextChunk, SearchHit)> = hits
            .into_iter()
            .map(|hit| {
                let recency = recency_score(hit.timestamp, bounds);
                let score = (1.0 - self.config.recency_weight) * hit.similarity
                    + self.config.recency_weight * recency;
                let chunk = ContextChunk {
                    exchange_id: hit.exchange_id.clone(),
                    text: hit.text.clone(),
                    similarity: hit.similarity,
                    recency,
                    score,
                };
                (chunk, hit)
            })
            .collect();

        scored.sort_by(|(a, ha), (b, hb)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| hb.timestamp.cmp(&ha.timestamp))
        });

        let unique = self.deduplicate(scored, &mut metrics)?;

        let mut chunks = Vec::with_capacity(top_k);
        for chunk in unique {
            if chunks.len() >= top_k {
                break;
            }
            if would_exceed_limit(metrics.total_tokens, &chunk.text, max_tokens) {
                metrics.truncated = true;
                debug!(
                    "Token budget reached at {} chunks ({} + {} > {})",
                    chunks.len(),
                    metrics.total_tokens,
                    estimate_tokens(&chunk.text),
                    max_tokens
                );
                break;
            }
            metrics.total_tokens += estimate_tokens(&chunk.text);
            chunks.push(chunk);
        }
        metrics.included = chunks.len();

        info!(
            "Context for session {}: {} candidates, {} duplicates, {} included (~{} tokens)",
            session_id, metrics.candidates, metrics.deduplicated, metrics.included, metrics.total_tokens
        );

        Ok(AssembledContext { chunks, metrics })
    }

    /// Drop near-identical chunks, keeping the first (higher-scored) one.
    fn deduplicate(
        &self,
        scored: Vec<(ContextChunk, SearchHit)>,
        metrics: &mut ContextMetrics,
    ) -> EngineResult<Vec<ContextChunk>> {
        let mut seen_prefixes = HashSet::new();
        let mut kept_vectors: Vec<Vec<f32>> = Vec::new();
        let mut unique = Vec::with_capacity(scored.len());

        'candidates: for (chunk, hit) in scored {
            if !seen_prefixes.insert(prefix_key(&chunk.text, self.config.dedup_prefix_chars)) {
                metrics.deduplicated += 1;
                continue;
            }
            for kept in &kept_vectors {
                if is_near_duplicate(kept, &hit.vector, self.config.dedup_threshold)? {
                    metrics.deduplicated += 1;
                    continue 'candidates;
                }
            }
            kept_vectors.push(hit.vector);
            unique.push(chunk);
        }

        Ok(unique)
    }
}

/// Linear in position between the session's oldest (0.0) and newest (1.0)
/// exchange. A session spanning no time scores 1.0.
pub fn recency_score(
    timestamp: DateTime<Utc>,
    bounds: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> f32 {
    let Some((oldest, newest)) = bounds else {
        return 1.0;
    };
    let span = (newest - oldest).num_milliseconds();
    if span <= 0 {
        return 1.0;
    }
    let offset = (timestamp - oldest).num_milliseconds();
    (offset as f64 / span as f64).clamp(0.0, 1.0) as f32
}

/// SHA-256 over the first `chars` characters of the whitespace-normalised,
/// lower-cased text.
pub fn prefix_key(text: &str, chars: usize) -> String {
    let normalized: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(chars)
        .collect();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::embedding_index::EmbeddingRecord;
    use crate::services::embedding_service::{HashingEmbeddingProvider, MockEmbeddingProvider};
    use crate::utils::token_estimator::estimate_chunks_tokens;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn config() -> RetrievalConfig {
        RetrievalConfig::default()
    }

    fn index(dim: usize) -> Arc<EmbeddingIndex> {
        Arc::new(EmbeddingIndex::new(
            Arc::new(HashingEmbeddingProvider::new(dim)),
            dim,
            Duration::from_secs(1),
        ))
    }

    fn put(index: &EmbeddingIndex, id: &str, vector: Vec<f32>, text: &str, age_min: i64) {
        index
            .add(EmbeddingRecord {
                exchange_id: id.into(),
                session_id: "s1".into(),
                vector,
                timestamp: Utc::now() - ChronoDuration::minutes(age_min),
                text: text.into(),
                revision: 0,
            })
            .unwrap();
    }

    #[test]
    fn test_recency_score_is_linear() {
        let old = Utc::now() - ChronoDuration::hours(1);
        let new = Utc::now();
        let mid = old + ChronoDuration::minutes(30);
        assert_eq!(recency_score(old, Some((old, new))), 0.0);
        assert_eq!(recency_score(new, Some((old, new))), 1.0);
        assert!((recency_score(mid, Some((old, new))) - 0.5).abs() < 0.01);
        assert_eq!(recency_score(new, Some((new, new))), 1.0);
        assert_eq!(recency_score(new, None), 1.0);
    }

    #[test]
    fn test_prefix_key_normalizes_whitespace_and_case() {
        assert_eq!(prefix_key("Q: Hello   World", 200), prefix_key("q: hello world", 200));
        assert_ne!(prefix_key("abc", 200), prefix_key("abd", 200));
        assert_eq!(prefix_key("same start, tail A", 10), prefix_key("same start, tail B", 10));
    }

    #[tokio::test]
    async fn test_empty_session_gives_empty_context_without_embedding() {
        // No expectations: any embed call would panic
        let mock = MockEmbeddingProvider::new();
        let index = Arc::new(EmbeddingIndex::new(Arc::new(mock), 3, Duration::from_secs(1)));
        let assembler = ContextAssembler::new(index, config());

        let ctx = assembler.get_context("anything", "s1", 5, 4000).await.unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_empty() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed().returning(|_| Err(anyhow::anyhow!("503")));
        let index = Arc::new(EmbeddingIndex::new(Arc::new(mock), 3, Duration::from_secs(1)));
        put(&index, "a", vec![1.0, 0.0, 0.0], "Q: a\nA: b", 0);

        let assembler = ContextAssembler::new(index, config());
        let assembled = assembler.assemble_scored("query", "s1", 5, 4000).await.unwrap();
        assert!(assembled.chunks.is_empty());
        assert!(assembled.metrics.embedding_failed);
    }

    #[test]
    fn test_near_duplicates_are_collapsed() {
        let index = index(3);
        put(&index, "a", vec![1.0, 0.0, 0.0], "Q: what?\nA: a chat app", 2);
        put(&index, "b", vec![0.999, 0.01, 0.0], "Q: what exactly?\nA: chat app", 1);
        put(&index, "c", vec![0.6, 0.8, 0.0], "Q: who?\nA: teams", 0);

        let assembler = ContextAssembler::new(Arc::clone(&index), config());
        let ctx = assembler
            .assemble_with_vector(&[1.0, 0.0, 0.0], "s1", 5, 4000)
            .unwrap();

        assert_eq!(ctx.metrics.candidates, 3);
        assert_eq!(ctx.metrics.deduplicated, 1);
        let ids: Vec<_> = ctx.chunks.iter().map(|c| c.exchange_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"c"));
    }

    #[test]
    fn test_identical_text_is_collapsed_by_prefix_hash() {
        let index = index(3);
        put(&index, "a", vec![1.0, 0.0, 0.0], "Q: x\nA: same", 1);
        put(&index, "b", vec![0.0, 1.0, 0.0], "Q:  x\nA: SAME", 0);

        let assembler = ContextAssembler::new(Arc::clone(&index), config());
        let ctx = assembler
            .assemble_with_vector(&[0.5, 0.5, 0.0], "s1", 5, 4000)
            .unwrap();
        assert_eq!(ctx.chunks.len(), 1);
        assert_eq!(ctx.metrics.deduplicated, 1);
    }

    #[test]
    fn test_respects_top_k_and_token_budget() {
        let index = index(16);
        for i in 0..12 {
            let mut v = vec![0.0; 16];
            v[i] = 1.0;
            v[15] = 1.0;
            put(&index, &format!("e{i}"), v, &format!("Q: {i}\nA: {}", "x".repeat(200)), i as i64);
        }
        let assembler = ContextAssembler::new(Arc::clone(&index), config());
        let mut query = vec![0.0; 16];
        query[15] = 1.0;

        let ctx = assembler.assemble_with_vector(&query, "s1", 3, 4000).unwrap();
        assert_eq!(ctx.chunks.len(), 3);

        let ctx = assembler.assemble_with_vector(&query, "s1", 5, 120).unwrap();
        let texts = ctx.texts();
        assert!(estimate_chunks_tokens(&texts) <= 120);
        assert_eq!(texts.len(), 2);
        assert!(ctx.metrics.truncated);

        // top_k above the ceiling is capped
        let ctx = assembler.assemble_with_vector(&query, "s1", 50, 100_000).unwrap();
        assert!(ctx.chunks.len() <= MAX_TOP_K);
    }

    #[test]
    fn test_recency_breaks_similarity_ties() {
        let index = index(3);
        put(&index, "old", vec![1.0, 0.0, 0.1], "Q: old\nA: old answer", 60);
        put(&index, "new", vec![1.0, 0.1, 0.0], "Q: new\nA: new answer", 0);

        let assembler = ContextAssembler::new(Arc::clone(&index), config());
        let ctx = assembler
            .assemble_with_vector(&[1.0, 0.0, 0.0], "s1", 2, 4000)
            .unwrap();
        // near-duplicate vectors, the newer one wins on recency
        assert_eq!(ctx.chunks[0].exchange_id, "new");
        assert!(ctx.chunks[0].recency > 0.99);
    }
}
