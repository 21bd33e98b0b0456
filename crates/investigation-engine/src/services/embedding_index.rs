use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::embedding_service::EmbeddingProvider;
use crate::models::{ExchangeId, SessionId};
use crate::utils::error::{EngineError, EngineResult};
use crate::utils::similarity::cosine_similarity;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub exchange_id: ExchangeId,
    pub session_id: SessionId,
    pub vector: Vec<f32>,
    /// Copied from the exchange so recency scoring needs no second lookup
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub revision: u32,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub exchange_id: ExchangeId,
    pub text: String,
    pub similarity: f32,
    pub timestamp: DateTime<Utc>,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Replaced,
    /// A newer revision is already indexed; nothing changed
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub sessions: usize,
    pub records: usize,
    pub dimension: usize,
}

type Partition = HashMap<ExchangeId, EmbeddingRecord>;

/// Process-wide vector store, partitioned by session. Every search stays
/// inside one partition.
pub struct EmbeddingIndex {
    provider: Arc<dyn EmbeddingProvider>,
    dimension: usize,
    embed_timeout: Duration,
    partitions: RwLock<HashMap<SessionId, Partition>>,
}

impl EmbeddingIndex {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, dimension: usize, embed_timeout: Duration) -> Self {
        Self {
            provider,
            dimension,
            embed_timeout,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Call the embedding collaborator, bounded by the configured timeout.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let vector = match tokio::time::timeout(self.embed_timeout, self.provider.embed(text)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!("Embedding call failed: {:#}", e);
                return Err(EngineError::EmbeddingFailure(e.to_string()));
            }
            Err(_) => {
                warn!("Embedding call timed out after {:?}", self.embed_timeout);
                return Err(EngineError::EmbeddingTimeout(self.embed_timeout.as_secs()));
            }
        };

        self.check_dimension(&vector)?;
        Ok(vector)
    }

    fn check_dimension(&self, vector: &[f32]) -> EngineResult<()> {
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert or replace a record. An older revision never overwrites a newer one.
    pub fn add(&self, record: EmbeddingRecord) -> EngineResult<AddOutcome> {
        self.check_dimension(&record.vector)?;

        let mut partitions = self.partitions.write();
        let partition = partitions.entry(record.session_id.clone()).or_default();

        let outcome = match partition.get(&record.exchange_id) {
            Some(existing) if existing.revision > record.revision => AddOutcome::Stale,
            Some(_) => AddOutcome::Replaced,
            None => AddOutcome::Inserted,
        };

        if outcome == AddOutcome::Stale {
            debug!(
                "Ignoring stale embedding for exchange {} (rev {})",
                record.exchange_id, record.revision
            );
        } else {
            partition.insert(record.exchange_id.clone(), record);
        }
        Ok(outcome)
    }

    pub fn remove(&self, session_id: &str, exchange_id: &str) -> bool {
        let mut partitions = self.partitions.write();
        let Some(partition) = partitions.get_mut(session_id) else {
            return false;
        };
        let removed = partition.remove(exchange_id).is_some();
        if partition.is_empty() {
            partitions.remove(session_id);
        }
        removed
    }

    pub fn remove_session(&self, session_id: &str) -> usize {
        self.partitions
            .write()
            .remove(session_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Top `k` records of one session by cosine similarity, best first.
    pub fn search(&self, query_vector: &[f32], session_id: &str, k: usize) -> EngineResult<Vec<SearchHit>> {
        self.check_dimension(query_vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(session_id) else {
            return Ok(Vec::new());
        };

        let mut hits = Vec::with_capacity(partition.len());
        for record in partition.values() {
            hits.push(SearchHit {
                exchange_id: record.exchange_id.clone(),
                text: record.text.clone(),
                similarity: cosine_similarity(query_vector, &record.vector)?,
                timestamp: record.timestamp,
                vector: record.vector.clone(),
            });
        }
        drop(partitions);

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Oldest and newest indexed timestamps of a session
    pub fn session_bounds(&self, session_id: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let partitions = self.partitions.read();
        let partition = partitions.get(session_id)?;
        let oldest = partition.values().map(|r| r.timestamp).min()?;
        let newest = partition.values().map(|r| r.timestamp).max()?;
        Some((oldest, newest))
    }

    /// Indexed revision of an exchange, if any
    pub fn revision_of(&self, session_id: &str, exchange_id: &str) -> Option<u32> {
        self.partitions
            .read()
            .get(session_id)
            .and_then(|p| p.get(exchange_id))
            .map(|r| r.revision)
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.partitions.read().get(session_id).map(|p| p.len()).unwrap_or(0)
    }

    pub fn stats(&self, session_id: Option<&str>) -> IndexStats {
        let partitions = self.partitions.read();
        match session_id {
            Some(id) => IndexStats {
                sessions: usize::from(partitions.contains_key(id)),
                records: partitions.get(id).map(|p| p.len()).unwrap_or(0),
                dimension: self.dimension,
            },
            None => IndexStats {
                sessions: partitions.len(),
                records: partitions.values().map(|p| p.len()).sum(),
                dimension: self.dimension,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::embedding_service::MockEmbeddingProvider;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    fn record(session: &str, id: &str, vector: Vec<f32>, revision: u32) -> EmbeddingRecord {
        EmbeddingRecord {
            exchange_id: id.into(),
            session_id: session.into(),
            vector,
            timestamp: Utc::now(),
            text: format!("Q: {id}\nA: ..."),
            revision,
        }
    }

    fn index_with(mock: MockEmbeddingProvider) -> EmbeddingIndex {
        EmbeddingIndex::new(Arc::new(mock), 3, Duration::from_millis(50))
    }

    #[test]
    fn test_search_is_filtered_by_session() {
        let index = index_with(MockEmbeddingProvider::new());
        index.add(record("s1", "a", vec![1.0, 0.0, 0.0], 0)).unwrap();
        index.add(record("s1", "b", vec![0.0, 1.0, 0.0], 0)).unwrap();
        index.add(record("s2", "c", vec![1.0, 0.0, 0.0], 0)).unwrap();

        let hits = index.search(&[1.0, 0.1, 0.0], "s1", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].exchange_id, "a");
        assert!(hits.iter().all(|h| h.exchange_id != "c"));

        assert!(index.search(&[1.0, 0.0, 0.0], "s3", 5).unwrap().is_empty());
        assert_eq!(index.search(&[1.0, 0.0, 0.0], "s1", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_older_revision_never_overwrites() {
        let index = index_with(MockEmbeddingProvider::new());
        assert_eq!(index.add(record("s1", "a", vec![1.0, 0.0, 0.0], 2)).unwrap(), AddOutcome::Inserted);
        assert_eq!(index.add(record("s1", "a", vec![0.0, 1.0, 0.0], 1)).unwrap(), AddOutcome::Stale);
        assert_eq!(index.revision_of("s1", "a"), Some(2));
        assert_eq!(index.add(record("s1", "a", vec![0.0, 1.0, 0.0], 3)).unwrap(), AddOutcome::Replaced);
        assert_eq!(index.revision_of("s1", "a"), Some(3));
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let index = index_with(MockEmbeddingProvider::new());
        let err = index.add(record("s1", "a", vec![1.0, 0.0], 0)).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 3, actual: 2 }));
        assert!(index.search(&[1.0], "s1", 3).is_err());
    }

    #[test]
    fn test_remove_and_bounds() {
        let index = index_with(MockEmbeddingProvider::new());
        let mut old = record("s1", "a", vec![1.0, 0.0, 0.0], 0);
        old.timestamp = Utc::now() - ChronoDuration::minutes(10);
        let oldest = old.timestamp;
        index.add(old).unwrap();
        index.add(record("s1", "b", vec![0.0, 1.0, 0.0], 0)).unwrap();

        let (lo, hi) = index.session_bounds("s1").unwrap();
        assert_eq!(lo, oldest);
        assert!(hi > lo);

        assert!(index.remove("s1", "a"));
        assert!(!index.remove("s1", "a"));
        assert_eq!(index.len("s1"), 1);
        assert_eq!(index.remove_session("s1"), 1);
        assert_eq!(index.stats(None).records, 0);
        assert!(index.session_bounds("s1").is_none());
    }

    #[tokio::test]
    async fn test_embed_maps_provider_errors() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));
        let index = index_with(mock);

        let err = index.embed("hello").await.unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingFailure(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_embed_checks_dimension() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed().returning(|_| Ok(vec![0.5; 7]));
        let index = index_with(mock);
        assert!(matches!(
            index.embed("hello").await.unwrap_err(),
            EngineError::DimensionMismatch { .. }
        ));
    }

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(vec![1.0, 0.0, 0.0])
        }
    }

    #[tokio::test]
    async fn test_embed_times_out() {
        let index = EmbeddingIndex::new(Arc::new(SlowProvider), 3, Duration::from_millis(20));
        let err = index.embed("hello").await.unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingTimeout(_)));
    }

    #[test]
    fn test_concurrent_adds_across_sessions() {
        let index = Arc::new(index_with(MockEmbeddingProvider::new()));
        let handles: Vec<_> = (0..4)
            .map(|s| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        index
                            .add(record(&format!("s{s}"), &format!("e{i}"), vec![1.0, i as f32, 0.0], 0))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = index.stats(None);
        assert_eq!(stats.sessions, 4);
        assert_eq!(stats.records, 200);
        assert_eq!(index.stats(Some("s2")).records, 50);
    }
}
