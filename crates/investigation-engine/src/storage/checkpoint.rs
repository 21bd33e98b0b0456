use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::validate_session_id;
use crate::models::{Category, ConversationState, Exchange, Session, SessionId, SessionStatus};
use crate::utils::error::{EngineError, EngineResult};

/// Full snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub id: SessionId,
    /// Current category; `None` at REVIEW/COMPLETE
    pub category_pointer: Option<Category>,
    pub state: ConversationState,
    pub status: SessionStatus,
    pub skipped_categories: Vec<Category>,
    pub exchanges: Vec<Exchange>,
    #[serde(default)]
    pub pending_followup: bool,
    #[serde(default)]
    pub question_counts: BTreeMap<Category, usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl SessionCheckpoint {
    pub fn capture(
        session: &Session,
        exchanges: &[Exchange],
        pending_followup: bool,
        question_counts: &BTreeMap<Category, usize>,
    ) -> Self {
        Self {
            id: session.id.clone(),
            category_pointer: session.category_pointer(),
            state: session.state,
            status: session.status,
            skipped_categories: session.skipped_categories.clone(),
            exchanges: exchanges.to_vec(),
            pending_followup,
            question_counts: question_counts.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            saved_at: Utc::now(),
        }
    }

    pub fn session(&self) -> Session {
        Session {
            id: self.id.clone(),
            state: self.state,
            skipped_categories: self.skipped_categories.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub id: SessionId,
    pub state: ConversationState,
    pub exchange_count: usize,
    pub saved_at: DateTime<Utc>,
}

/// One JSON document per session, replaced atomically on every save.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    pub async fn save(&self, checkpoint: &SessionCheckpoint) -> EngineResult<()> {
        validate_session_id(&checkpoint.id)?;

        let json = serde_json::to_string_pretty(checkpoint)?;
        let path = self.path_for(&checkpoint.id);
        let temp_path = path.with_extension("json.tmp");

        let write = async {
            fs::create_dir_all(&self.dir).await?;
            fs::write(&temp_path, json.as_bytes()).await?;
            fs::rename(&temp_path, &path).await
        };

        write.await.map_err(|e| EngineError::StorageWriteFailure {
            attempts: 1,
            message: format!("checkpoint {}: {}", checkpoint.id, e),
        })?;

        info!(
            "Checkpoint saved: session={}, state={}, exchanges={}",
            checkpoint.id,
            checkpoint.state,
            checkpoint.exchanges.len()
        );
        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> EngineResult<SessionCheckpoint> {
        validate_session_id(session_id)?;

        let raw = match fs::read_to_string(self.path_for(session_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(EngineError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(EngineError::StorageReadFailure(e.to_string())),
        };

        let checkpoint: SessionCheckpoint = serde_json::from_str(&raw)?;
        if checkpoint.id != session_id {
            return Err(EngineError::CorruptRecord(format!(
                "checkpoint file for {} holds session {}",
                session_id, checkpoint.id
            )));
        }

        debug!("Checkpoint loaded: session={}", session_id);
        Ok(checkpoint)
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        validate_session_id(session_id).is_ok()
            && fs::try_exists(self.path_for(session_id))
                .await
                .unwrap_or(false)
    }

    /// Summaries of every readable checkpoint, most recently saved first.
    pub async fn list(&self) -> EngineResult<Vec<CheckpointSummary>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::StorageReadFailure(e.to_string())),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::StorageReadFailure(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match self.load(session_id).await {
                Ok(cp) => summaries.push(CheckpointSummary {
                    id: cp.id,
                    state: cp.state,
                    exchange_count: cp.exchanges.len(),
                    saved_at: cp.saved_at,
                }),
                Err(e) => warn!("Skipping checkpoint {}: {}", path.display(), e),
            }
        }

        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(summaries)
    }

    pub async fn delete(&self, session_id: &str) -> EngineResult<bool> {
        validate_session_id(session_id)?;

        match fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => {
                info!("Checkpoint deleted: session={}", session_id);
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::StorageWriteFailure {
                attempts: 1,
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> (Session, Vec<Exchange>) {
        let mut session = Session::new(id.to_string());
        session.advance(false);
        session.advance(false);
        session.skipped_categories.push(Category::Functionality);

        let exchanges = vec![Exchange {
            id: "e1".into(),
            question: "Who will use it?".into(),
            answer: "Remote\nteams".into(),
            category: Some(Category::Users),
            timestamp: Utc::now(),
            is_followup: false,
            revision: 1,
        }];
        (session, exchanges)
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (session, exchanges) = sample("s1");
        let mut counts = BTreeMap::new();
        counts.insert(Category::Users, 2);

        let cp = SessionCheckpoint::capture(&session, &exchanges, true, &counts);
        store.save(&cp).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(loaded.session(), session);
        assert_eq!(loaded.category_pointer, Some(Category::Users));
        assert!(!dir.path().join("s1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_document_uses_documented_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (session, exchanges) = sample("s1");
        store
            .save(&SessionCheckpoint::capture(&session, &exchanges, false, &BTreeMap::new()))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("s1.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["category_pointer"], "users");
        assert_eq!(value["skipped_categories"][0], "functionality");
        assert_eq!(value["exchanges"][0]["is_followup"], false);
        assert!(value["saved_at"].is_string());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_session_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let err = store.load("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
        assert!(!store.exists("ghost").await);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(
            store.load("bad").await.unwrap_err(),
            EngineError::CorruptRecord(_)
        ));
        // list skips it
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_newest_first_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        for id in ["a", "b"] {
            let (session, exchanges) = sample(id);
            store
                .save(&SessionCheckpoint::capture(&session, &exchanges, false, &BTreeMap::new()))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let list = store.list().await.unwrap();
        assert_eq!(list.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(list[0].exchange_count, 1);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
