use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::{SessionHandle, SessionRegistry};
use super::types::{SessionSnapshot, SessionState, TurnOutcome};
use crate::config::{ControllerConfig, Settings};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::{ConversationState, Exchange, ExchangeId, Session, SessionId};
use crate::services::classifier::{classify, followup_reason, FollowupReason};
use crate::services::context_assembler::{AssembledContext, ContextAssembler};
use crate::services::embedding_index::{EmbeddingIndex, EmbeddingRecord};
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::question::{template_for, NextQuestion, QuestionRenderer, TextCompletionProvider};
use crate::storage::{CheckpointStore, CheckpointSummary, ExchangeLog, SessionCheckpoint};
use crate::utils::error::{EngineError, EngineResult};

/// Drives each session through the category sequence.
///
/// A session's mutex is held while its state changes and while the exchange
/// is appended to the log. Embedding, context retrieval, question rendering
/// and checkpoint writes all run after it is released.
pub struct ConversationController {
    registry: SessionRegistry,
    log: ExchangeLog,
    checkpoints: CheckpointStore,
    index: Arc<EmbeddingIndex>,
    assembler: ContextAssembler,
    renderer: QuestionRenderer,
    logger: ActivityLogger,
    config: ControllerConfig,
}

impl ConversationController {
    pub fn new(settings: &Settings, embedder: Arc<dyn EmbeddingProvider>, logger: ActivityLogger) -> Self {
        let index = Arc::new(EmbeddingIndex::new(
            embedder,
            settings.embedding.dimension,
            std::time::Duration::from_secs(settings.embedding.timeout_seconds),
        ));

        info!(
            "Initializing ConversationController: followup_threshold={}, auto_save_interval={}, review_stage={}",
            settings.controller.followup_word_threshold,
            settings.controller.auto_save_interval,
            settings.controller.review_stage
        );

        Self {
            registry: SessionRegistry::new(),
            log: ExchangeLog::new(
                settings.storage.conversation_dir.clone(),
                settings.storage.retry_policy(),
            ),
            checkpoints: CheckpointStore::new(settings.storage.checkpoint_dir.clone()),
            assembler: ContextAssembler::new(Arc::clone(&index), settings.retrieval.clone()),
            index,
            renderer: QuestionRenderer::templates_only(),
            logger,
            config: settings.controller.clone(),
        }
    }

    /// Phrase questions through a completion provider instead of templates,
    /// bounded by `controller.external_timeout_seconds`.
    pub fn with_completion_provider(self, provider: Arc<dyn TextCompletionProvider>) -> Self {
        let timeout = self.config.external_timeout();
        info!("Question wording via completion provider (timeout {:?})", timeout);
        self.with_renderer(QuestionRenderer::new(provider, timeout))
    }

    pub fn with_renderer(mut self, renderer: QuestionRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    pub fn exchange_log(&self) -> &ExchangeLog {
        &self.log
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    fn handle(&self, session_id: &str) -> EngineResult<Arc<SessionHandle>> {
        self.registry
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Set the pending question for the session's current state.
    /// Returns `None` (and clears the pending question) once COMPLETE.
    fn issue_question(st: &mut SessionState, is_followup: bool) -> Option<NextQuestion> {
        let state = st.session.state;
        let asked = match state {
            ConversationState::Category(c) => {
                let count = st.question_counts.entry(c).or_insert(0);
                let asked = *count;
                *count += 1;
                asked
            }
            ConversationState::Review => 0,
            ConversationState::Start | ConversationState::Complete => {
                st.pending = None;
                return None;
            }
        };

        let question = NextQuestion {
            exchange_id: Uuid::new_v4().to_string(),
            state,
            category: state.category(),
            is_followup,
            prompt: template_for(state, is_followup, asked).to_string(),
            context: Vec::new(),
        };
        st.pending = Some(question.clone());
        Some(question)
    }

    // ===== Operations =====

    pub async fn start_session(&self) -> EngineResult<(SessionId, NextQuestion)> {
        let session_id = Uuid::new_v4().to_string();

        let mut session = Session::new(session_id.clone());
        session.advance(self.config.review_stage);
        let mut state = SessionState::new(session);
        let question = Self::issue_question(&mut state, false)
            .ok_or_else(|| EngineError::validation("no category to start from"))?;
        let handle = self.registry.insert(state);

        info!("Session {} started at {}", session_id, question.state);
        self.logger.log(
            ActivityLog::builder(&session_id, ActivityType::SessionCreated)
                .exchange_id(&question.exchange_id)
                .status(ActivityStatus::Info)
                .build(),
        );

        let query = question.prompt.clone();
        let question = self.prepare_question(&handle, question, &query).await?;
        Ok((session_id, question))
    }

    /// Record the answer to the pending question and decide what comes next.
    pub async fn process_answer(&self, session_id: &str, answer_text: &str) -> EngineResult<TurnOutcome> {
        let started = Instant::now();
        let answer = answer_text.trim();
        if answer.is_empty() {
            return Err(EngineError::validation("answer must not be empty"));
        }
        let handle = self.handle(session_id)?;

        let (next, to_index, checkpoint) = {
            let mut st = handle.state.lock().await;
            if st.session.is_complete() {
                return Err(EngineError::SessionComplete(session_id.to_string()));
            }
            let pending = st.pending.clone().ok_or_else(|| {
                EngineError::validation(format!("session {} has no pending question", session_id))
            })?;

            let exchange = Exchange {
                id: pending.exchange_id.clone(),
                question: pending.prompt.clone(),
                answer: answer.to_string(),
                category: pending.category,
                timestamp: Utc::now(),
                is_followup: pending.is_followup,
                revision: 0,
            };

            // Nothing in memory changes unless the record is on disk
            self.log.append_exchange(session_id, &exchange).await?;

            st.exchanges.push(exchange.clone());
            st.answers_since_save += 1;
            st.session.touch();

            // What the answer talks about, which may not be what was asked
            let topic = classify(answer);
            if topic.is_some() && topic != exchange.category {
                debug!(
                    "Session {}: answer in {} reads as {:?}",
                    session_id,
                    exchange.category_label(),
                    topic
                );
            }
            self.logger.log(
                ActivityLog::builder(session_id, ActivityType::AnswerRecorded)
                    .exchange_id(&exchange.id)
                    .message(answer)
                    .custom("topic", topic.map(|c| c.as_str()))
                    .build(),
            );

            let reason = followup_reason(
                answer,
                st.session.state,
                self.config.followup_word_threshold,
                self.config.vague_answer_followup,
            );

            let next = match reason {
                Some(reason) => {
                    let detail = match reason {
                        FollowupReason::TooShort { words, threshold } => {
                            format!("{} words < {}", words, threshold)
                        }
                        FollowupReason::Vague => "vague answer".to_string(),
                    };
                    debug!("Session {}: follow-up in {} ({})", session_id, st.session.state, detail);
                    self.logger.log(
                        ActivityLog::builder(session_id, ActivityType::FollowupRequested)
                            .exchange_id(&exchange.id)
                            .message(detail)
                            .build(),
                    );
                    Self::issue_question(&mut st, true)
                }
                None => {
                    let from = st.session.state;
                    let to = st.session.advance(self.config.review_stage);
                    info!("Session {}: {} -> {}", session_id, from, to);
                    let activity = if to.is_complete() {
                        ActivityType::SessionCompleted
                    } else {
                        ActivityType::CategoryAdvanced
                    };
                    self.logger.log(
                        ActivityLog::builder(session_id, activity)
                            .message(format!("{} -> {}", from, to))
                            .build(),
                    );
                    Self::issue_question(&mut st, false)
                }
            };

            let mut to_index = vec![exchange];
            let stale: Vec<ExchangeId> = st.reindex.drain().collect();
            for id in stale {
                if let Some(idx) = st.find_exchange(&id) {
                    to_index.push(st.exchanges[idx].clone());
                }
            }

            let checkpoint = (st.answers_since_save % self.config.auto_save_interval.max(1) == 0)
                .then(|| {
                    (
                        SessionCheckpoint::capture(
                            &st.session,
                            &st.exchanges,
                            st.pending_followup(),
                            &st.question_counts,
                        ),
                        st.answers_since_save,
                    )
                });

            (next, to_index, checkpoint)
        };

        let failed = self.index_exchanges(session_id, &to_index).await;

        let outcome = match next {
            Some(question) => {
                let query = format!("{}\n{}", question.prompt, answer);
                self.prepare_question(&handle, question, &query)
                    .await
                    .map(TurnOutcome::Question)
            }
            None => {
                info!("Session {} complete", session_id);
                Ok(TurnOutcome::Complete)
            }
        };

        let saved = match checkpoint {
            Some((cp, counted)) => self.write_checkpoint(&cp, true).await.ok().map(|_| counted),
            None => None,
        };

        {
            let mut st = handle.state.lock().await;
            st.reindex.extend(failed);
            if let Some(counted) = saved {
                st.answers_since_save = st.answers_since_save.saturating_sub(counted);
                st.checkpoints_saved += 1;
            }
        }

        debug!(
            "process_answer for session {} took {:?}",
            session_id,
            started.elapsed()
        );
        outcome
    }

    /// Move past the current category without answering. No-op once COMPLETE.
    pub async fn skip(&self, session_id: &str) -> EngineResult<TurnOutcome> {
        let handle = self.handle(session_id)?;

        let next = {
            let mut st = handle.state.lock().await;
            if st.session.is_complete() {
                debug!("Skip on completed session {} ignored", session_id);
                return Ok(TurnOutcome::Complete);
            }

            let from = st.session.state;
            if let Some(category) = from.category() {
                st.session.skipped_categories.push(category);
            }
            let to = st.session.advance(self.config.review_stage);
            info!("Session {}: skipped {} -> {}", session_id, from, to);

            self.logger.log(
                ActivityLog::builder(session_id, ActivityType::CategorySkipped)
                    .message(format!("{} -> {}", from, to))
                    .build(),
            );
            if to.is_complete() {
                self.logger
                    .log(ActivityLog::builder(session_id, ActivityType::SessionCompleted).build());
            }

            Self::issue_question(&mut st, false)
        };

        match next {
            Some(question) => {
                let query = question.prompt.clone();
                Ok(TurnOutcome::Question(
                    self.prepare_question(&handle, question, &query).await?,
                ))
            }
            None => Ok(TurnOutcome::Complete),
        }
    }

    /// Replace a recorded answer. The stale embedding is dropped at once and
    /// the new text is indexed before returning (or on the next turn if the
    /// embedding call fails).
    pub async fn edit(&self, session_id: &str, exchange_id: &str, new_answer_text: &str) -> EngineResult<()> {
        let new_answer = new_answer_text.trim();
        if new_answer.is_empty() {
            return Err(EngineError::validation("answer must not be empty"));
        }
        let handle = self.handle(session_id)?;

        let updated = {
            let mut st = handle.state.lock().await;
            let idx = st
                .find_exchange(exchange_id)
                .ok_or_else(|| EngineError::ExchangeNotFound {
                    session_id: session_id.to_string(),
                    exchange_id: exchange_id.to_string(),
                })?;

            let mut updated = st.exchanges[idx].clone();
            updated.answer = new_answer.to_string();
            updated.revision += 1;

            self.log.append_exchange(session_id, &updated).await?;

            st.exchanges[idx] = updated.clone();
            st.session.touch();
            self.index.remove(session_id, exchange_id);
            st.reindex.insert(exchange_id.to_string());
            updated
        };

        match self.index_exchange(session_id, &updated).await {
            Ok(()) => {
                let mut st = handle.state.lock().await;
                let current = st
                    .find_exchange(exchange_id)
                    .map(|idx| st.exchanges[idx].revision);
                if current == Some(updated.revision) {
                    st.reindex.remove(exchange_id);
                }
            }
            Err(e) => warn!(
                "Re-embedding edited exchange {} failed, retrying next turn: {}",
                exchange_id, e
            ),
        }

        info!(
            "Session {}: exchange {} edited (rev {})",
            session_id, exchange_id, updated.revision
        );
        self.logger.log(
            ActivityLog::builder(session_id, ActivityType::AnswerEdited)
                .exchange_id(exchange_id)
                .custom("revision", updated.revision)
                .build(),
        );
        Ok(())
    }

    pub async fn get_context(
        &self,
        session_id: &str,
        query: &str,
        top_k: usize,
        max_tokens: usize,
    ) -> EngineResult<Vec<String>> {
        self.handle(session_id)?;
        let assembled = self
            .assembler
            .assemble_scored(query, session_id, top_k, max_tokens)
            .await?;
        self.log_context(session_id, &assembled);
        Ok(assembled.texts())
    }

    /// Manual checkpoint. Unlike auto-save, a failure is returned.
    pub async fn save_session(&self, session_id: &str) -> EngineResult<()> {
        let handle = self.handle(session_id)?;
        let (checkpoint, counted) = {
            let st = handle.state.lock().await;
            (
                SessionCheckpoint::capture(
                    &st.session,
                    &st.exchanges,
                    st.pending_followup(),
                    &st.question_counts,
                ),
                st.answers_since_save,
            )
        };

        self.write_checkpoint(&checkpoint, false).await?;

        let mut st = handle.state.lock().await;
        st.answers_since_save = st.answers_since_save.saturating_sub(counted);
        st.checkpoints_saved += 1;
        Ok(())
    }

    /// Rebuild a session from its checkpoint, replacing any live copy, and
    /// re-index its exchanges.
    pub async fn load_session(&self, session_id: &str) -> EngineResult<(Session, Vec<Exchange>)> {
        let checkpoint = self.checkpoints.load(session_id).await?;
        let session = checkpoint.session();

        let mut state = SessionState::new(session.clone());
        state.exchanges = checkpoint.exchanges;
        state.question_counts = checkpoint.question_counts;
        self.continue_revisions(session_id, &mut state.exchanges).await;
        // The saved counts already include the question that was pending
        if let Some(category) = session.category_pointer() {
            if let Some(count) = state.question_counts.get_mut(&category) {
                *count = count.saturating_sub(1);
            }
        }
        Self::issue_question(&mut state, checkpoint.pending_followup);

        let exchanges = state.exchanges.clone();
        let handle = self.registry.insert(state);

        self.index.remove_session(session_id);
        let failed = self.index_exchanges(session_id, &exchanges).await;
        if !failed.is_empty() {
            warn!(
                "Session {} restored with {} exchanges not indexed",
                session_id,
                failed.len()
            );
            handle.state.lock().await.reindex.extend(failed);
        }

        info!(
            "Session {} restored at {} with {} exchanges",
            session_id,
            session.state,
            exchanges.len()
        );
        self.logger.log(
            ActivityLog::builder(session_id, ActivityType::SessionRestored)
                .chunk_count(exchanges.len())
                .build(),
        );

        Ok((session, exchanges))
    }

    // ===== Reads =====

    pub async fn session(&self, session_id: &str) -> EngineResult<SessionSnapshot> {
        let handle = self.handle(session_id)?;
        let st = handle.state.lock().await;
        Ok(SessionSnapshot::from(&*st))
    }

    pub async fn history(&self, session_id: &str) -> EngineResult<Vec<Exchange>> {
        let handle = self.handle(session_id)?;
        let st = handle.state.lock().await;
        Ok(st.exchanges.clone())
    }

    pub async fn is_complete(&self, session_id: &str) -> EngineResult<bool> {
        let handle = self.handle(session_id)?;
        let st = handle.state.lock().await;
        Ok(st.session.is_complete())
    }

    pub async fn current_question(&self, session_id: &str) -> EngineResult<Option<NextQuestion>> {
        let handle = self.handle(session_id)?;
        let st = handle.state.lock().await;
        Ok(st.pending.clone())
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.registry.ids()
    }

    pub async fn list_checkpoints(&self) -> EngineResult<Vec<CheckpointSummary>> {
        self.checkpoints.list().await
    }

    /// Forget a session everywhere: registry, index, log and checkpoint.
    pub async fn delete_session(&self, session_id: &str) -> EngineResult<()> {
        let live = self.registry.remove(session_id).is_some();
        let indexed = self.index.remove_session(session_id);
        let logged = self.log.delete(session_id).await?;
        let saved = self.checkpoints.delete(session_id).await?;

        if !(live || logged || saved) {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }
        info!(
            "Session {} deleted (live={}, indexed={}, log={}, checkpoint={})",
            session_id, live, indexed, logged, saved
        );
        Ok(())
    }

    // ===== Internals =====

    /// Attach retrieved context, render the wording and store it as the
    /// pending question if nothing superseded it meanwhile.
    async fn prepare_question(
        &self,
        handle: &SessionHandle,
        mut question: NextQuestion,
        query: &str,
    ) -> EngineResult<NextQuestion> {
        let assembled = self
            .assembler
            .assemble_scored(
                query,
                &handle.id,
                self.assembler.default_top_k(),
                self.assembler.config().max_tokens,
            )
            .await?;
        self.log_context(&handle.id, &assembled);

        question.context = assembled.texts();
        question.prompt = self.renderer.render(&question).await;

        let mut st = handle.state.lock().await;
        if let Some(pending) = st.pending.as_mut() {
            if pending.exchange_id == question.exchange_id {
                *pending = question.clone();
            }
        }
        Ok(question)
    }

    /// Edits made after the checkpoint are still in the log. Carry their
    /// revision numbers forward so later edits keep counting upward.
    async fn continue_revisions(&self, session_id: &str, exchanges: &mut [Exchange]) {
        let logged = match self.log.load(session_id).await {
            Ok(logged) => logged,
            Err(e) => {
                warn!("Could not read log of session {} on restore: {}", session_id, e);
                return;
            }
        };
        let latest: HashMap<&str, u32> = logged
            .iter()
            .map(|e| (e.id.as_str(), e.revision))
            .collect();
        for exchange in exchanges.iter_mut() {
            if let Some(&revision) = latest.get(exchange.id.as_str()) {
                if revision > exchange.revision {
                    debug!(
                        "Exchange {} continues at rev {} (checkpoint had {})",
                        exchange.id, revision, exchange.revision
                    );
                    exchange.revision = revision;
                }
            }
        }
    }

    async fn index_exchange(&self, session_id: &str, exchange: &Exchange) -> EngineResult<()> {
        let text = exchange.chunk_text();
        let vector = self.index.embed(&text).await?;
        let outcome = self.index.add(EmbeddingRecord {
            exchange_id: exchange.id.clone(),
            session_id: session_id.to_string(),
            vector,
            timestamp: exchange.timestamp,
            text,
            revision: exchange.revision,
        })?;
        debug!(
            "Indexed exchange {} rev {} ({:?})",
            exchange.id, exchange.revision, outcome
        );
        Ok(())
    }

    /// Returns the ids that could not be indexed.
    async fn index_exchanges(&self, session_id: &str, exchanges: &[Exchange]) -> Vec<ExchangeId> {
        let mut failed = Vec::new();
        for exchange in exchanges {
            if let Err(e) = self.index_exchange(session_id, exchange).await {
                warn!(
                    "Indexing exchange {} of session {} failed ({:?}): {}",
                    exchange.id,
                    session_id,
                    e.kind(),
                    e
                );
                failed.push(exchange.id.clone());
            }
        }
        failed
    }

    async fn write_checkpoint(&self, checkpoint: &SessionCheckpoint, auto: bool) -> EngineResult<()> {
        match self.checkpoints.save(checkpoint).await {
            Ok(()) => {
                self.logger.log(
                    ActivityLog::builder(&checkpoint.id, ActivityType::CheckpointSaved)
                        .chunk_count(checkpoint.exchanges.len())
                        .custom("auto", auto)
                        .build(),
                );
                Ok(())
            }
            Err(e) => {
                if auto {
                    warn!(
                        "Auto-checkpoint for session {} failed, retrying at next interval: {}",
                        checkpoint.id, e
                    );
                } else {
                    error!("Checkpoint for session {} failed: {}", checkpoint.id, e);
                }
                self.logger.log(
                    ActivityLog::builder(&checkpoint.id, ActivityType::CheckpointFailed)
                        .error(e.to_string(), format!("{:?}", e.kind()))
                        .custom("auto", auto)
                        .build(),
                );
                Err(e)
            }
        }
    }

    fn log_context(&self, session_id: &str, assembled: &AssembledContext) {
        let metrics = &assembled.metrics;
        let activity = if metrics.embedding_failed {
            ActivityLog::builder(session_id, ActivityType::ContextFallback)
                .status(ActivityStatus::Warning)
                .build()
        } else {
            ActivityLog::builder(session_id, ActivityType::ContextRetrieved)
                .chunk_count(metrics.included)
                .token_count(metrics.total_tokens)
                .custom("candidates", metrics.candidates)
                .custom("deduplicated", metrics.deduplicated)
                .build()
        };
        self.logger.log(activity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use crate::services::embedding_service::{HashingEmbeddingProvider, MockEmbeddingProvider};
    use crate::services::question::MockTextCompletionProvider;
    use std::path::Path;

    const LONG: &str = "A task management app for remote teams integrating GitHub and Slack for async standups and sprint planning";

    fn settings(root: &Path) -> Settings {
        let mut s = Settings::default();
        s.storage.conversation_dir = root.join("conversations");
        s.storage.checkpoint_dir = root.join("sessions");
        s.storage.retry_base_delay_ms = 1;
        s.storage.retry_max_delay_ms = 2;
        s.embedding.dimension = 64;
        s.embedding.timeout_seconds = 1;
        s
    }

    fn controller(root: &Path) -> ConversationController {
        ConversationController::new(
            &settings(root),
            Arc::new(HashingEmbeddingProvider::new(64)),
            ActivityLogger::disabled(),
        )
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());

        assert!(matches!(
            c.process_answer("ghost", LONG).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
        assert!(matches!(c.skip("ghost").await.unwrap_err(), EngineError::SessionNotFound(_)));
        assert!(matches!(
            c.edit("ghost", "e", "x").await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
        assert!(matches!(
            c.get_context("ghost", "q", 5, 4000).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
        assert!(c.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_empty_answer_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let (sid, _) = c.start_session().await.unwrap();

        let err = c.process_answer(&sid, "   ").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(c.history(&sid).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_answer_is_stored_under_announced_exchange_id() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let (sid, first) = c.start_session().await.unwrap();
        assert!(!first.is_followup);
        assert_eq!(first.category, Some(Category::Functionality));

        c.process_answer(&sid, LONG).await.unwrap();
        let history = c.history(&sid).await.unwrap();
        assert_eq!(history[0].id, first.exchange_id);
        assert_eq!(history[0].question, first.prompt);
        assert_eq!(c.exchange_log().load(&sid).await.unwrap(), history);
        assert_eq!(c.index().len(&sid), 1);
    }

    #[tokio::test]
    async fn test_log_failure_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let mut s = settings(dir.path());
        s.storage.conversation_dir = blocker.join("conversations");
        let c = ConversationController::new(
            &s,
            Arc::new(HashingEmbeddingProvider::new(64)),
            ActivityLogger::disabled(),
        );

        let (sid, first) = c.start_session().await.unwrap();
        let err = c.process_answer(&sid, LONG).await.unwrap_err();
        assert!(matches!(err, EngineError::StorageWriteFailure { attempts: 4, .. }));
        assert_eq!(err.kind(), crate::utils::ErrorKind::Unrecoverable);

        let snap = c.session(&sid).await.unwrap();
        assert_eq!(snap.exchange_count, 0);
        assert_eq!(snap.session.state, ConversationState::Category(Category::Functionality));
        assert_eq!(snap.pending.unwrap().exchange_id, first.exchange_id);
    }

    #[tokio::test]
    async fn test_embedding_outage_degrades_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockEmbeddingProvider::new();
        let healthy = HashingEmbeddingProvider::new(64);
        let mut calls = 0;
        mock.expect_embed().returning(move |text| {
            calls += 1;
            // First few calls fail, the rest succeed
            if calls <= 3 {
                Err(anyhow::anyhow!("embedding server down"))
            } else {
                Ok(healthy.embed_sync(text))
            }
        });
        let c = ConversationController::new(&settings(dir.path()), Arc::new(mock), ActivityLogger::disabled());

        let (sid, _) = c.start_session().await.unwrap();
        // exchange embed fails (1); index empty so no query embed
        let out = c.process_answer(&sid, LONG).await.unwrap();
        assert!(out.question().unwrap().context.is_empty());
        assert_eq!(c.index().len(&sid), 0);
        assert_eq!(c.session(&sid).await.unwrap().exchange_count, 1);

        // embeds for the new exchange and the retried one fail (2, 3); context empty
        c.process_answer(&sid, LONG).await.unwrap();
        assert_eq!(c.index().len(&sid), 0);

        // now healthy: both earlier exchanges and this one get indexed
        let out = c.process_answer(&sid, LONG).await.unwrap();
        assert_eq!(c.index().len(&sid), 3);
        assert!(!out.question().unwrap().context.is_empty());
    }

    const HEDGING: &str = "Not sure yet, maybe something for people who need to organise work across several different time zones";

    #[tokio::test]
    async fn test_long_hedging_answer_advances_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let (sid, _) = c.start_session().await.unwrap();

        let out = c.process_answer(&sid, HEDGING).await.unwrap();
        let q = out.question().unwrap();
        assert!(!q.is_followup);
        assert_eq!(q.category, Some(Category::Users));
    }

    #[tokio::test]
    async fn test_followup_on_vague_answer_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.controller.vague_answer_followup = true;
        let c = ConversationController::new(&s, Arc::new(HashingEmbeddingProvider::new(64)), ActivityLogger::disabled());
        let (sid, _) = c.start_session().await.unwrap();

        let out = c.process_answer(&sid, HEDGING).await.unwrap();
        let q = out.question().unwrap();
        assert!(q.is_followup);
        assert_eq!(q.category, Some(Category::Functionality));
    }

    #[tokio::test]
    async fn test_completion_provider_words_questions() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockTextCompletionProvider::new();
        mock.expect_generate()
            .returning(|_, _| Ok("Which problem keeps your users up at night".into()));
        let c = controller(dir.path()).with_completion_provider(Arc::new(mock));

        let (sid, first) = c.start_session().await.unwrap();
        assert_eq!(first.prompt, "Which problem keeps your users up at night?");
        c.process_answer(&sid, LONG).await.unwrap();
        assert_eq!(c.history(&sid).await.unwrap()[0].question, first.prompt);
    }

    struct StalledCompletion;

    #[async_trait::async_trait]
    impl TextCompletionProvider for StalledCompletion {
        async fn generate(&self, _prompt: &str, _ctx: &[String]) -> anyhow::Result<String> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok("never used?".into())
        }
    }

    #[tokio::test]
    async fn test_completion_bounded_by_external_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.controller.external_timeout_seconds = 1;
        let c = ConversationController::new(&s, Arc::new(HashingEmbeddingProvider::new(64)), ActivityLogger::disabled())
            .with_completion_provider(Arc::new(StalledCompletion));

        let started = Instant::now();
        let (_, first) = c.start_session().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(first.prompt, template_for(first.state, false, 0));
    }

    #[tokio::test]
    async fn test_review_stage_then_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.controller.review_stage = true;
        let c = ConversationController::new(&s, Arc::new(HashingEmbeddingProvider::new(64)), ActivityLogger::disabled());

        let (sid, _) = c.start_session().await.unwrap();
        for _ in 0..5 {
            c.skip(&sid).await.unwrap();
        }
        let out = c.process_answer(&sid, LONG).await.unwrap();
        assert_eq!(out.question().unwrap().state, ConversationState::Review);
        assert_eq!(out.question().unwrap().category, None);

        // short answers do not trigger follow-ups in review
        let out = c.process_answer(&sid, "Looks right").await.unwrap();
        assert!(out.is_complete());
        assert!(c.is_complete(&sid).await.unwrap());

        let err = c.process_answer(&sid, LONG).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionComplete(_)));
        assert_eq!(c.history(&sid).await.unwrap().len(), 2);
        assert_eq!(c.history(&sid).await.unwrap()[1].category, None);
    }

    #[tokio::test]
    async fn test_edit_supersedes_in_log_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let (sid, first) = c.start_session().await.unwrap();
        c.process_answer(&sid, LONG).await.unwrap();

        c.edit(&sid, &first.exchange_id, "A recipe planner for families who cook together on weekends and share shopping lists")
            .await
            .unwrap();

        assert_eq!(c.index().revision_of(&sid, &first.exchange_id), Some(1));
        let logged = c.exchange_log().load(&sid).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].answer.starts_with("A recipe planner"));
        assert_eq!(logged[0].revision, 1);
        assert!(c.session(&sid).await.unwrap().pending.is_some());
    }

    #[tokio::test]
    async fn test_delete_session_forgets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        let (sid, _) = c.start_session().await.unwrap();
        c.process_answer(&sid, LONG).await.unwrap();
        c.save_session(&sid).await.unwrap();

        c.delete_session(&sid).await.unwrap();
        assert!(c.sessions().is_empty());
        assert_eq!(c.index().len(&sid), 0);
        assert!(c.exchange_log().load(&sid).await.unwrap().is_empty());
        assert!(matches!(c.load_session(&sid).await.unwrap_err(), EngineError::SessionNotFound(_)));
        assert!(matches!(c.delete_session(&sid).await.unwrap_err(), EngineError::SessionNotFound(_)));
    }
}
