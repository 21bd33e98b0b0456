use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::models::{Category, Exchange, ExchangeId, Session};
use crate::services::question::NextQuestion;

/// Everything the controller holds for one session, guarded by the
/// session's mutex.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session: Session,
    pub exchanges: Vec<Exchange>,
    /// The question the next answer belongs to; `None` once complete
    pub pending: Option<NextQuestion>,
    /// Questions issued per category, for template rotation
    pub question_counts: BTreeMap<Category, usize>,
    /// Answers recorded since the last successful checkpoint
    pub answers_since_save: usize,
    pub checkpoints_saved: usize,
    /// Exchanges whose current revision is not in the index yet
    pub reindex: HashSet<ExchangeId>,
}

impl SessionState {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            exchanges: Vec::new(),
            pending: None,
            question_counts: BTreeMap::new(),
            answers_since_save: 0,
            checkpoints_saved: 0,
            reindex: HashSet::new(),
        }
    }

    pub fn find_exchange(&self, exchange_id: &str) -> Option<usize> {
        self.exchanges.iter().position(|e| e.id == exchange_id)
    }

    pub fn pending_followup(&self) -> bool {
        self.pending.as_ref().map(|q| q.is_followup).unwrap_or(false)
    }
}

/// Result of a turn: the next question, or the end of the investigation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    Question(NextQuestion),
    Complete,
}

impl TurnOutcome {
    pub fn question(&self) -> Option<&NextQuestion> {
        match self {
            Self::Question(q) => Some(q),
            Self::Complete => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Read-only view of a session for status queries
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub exchange_count: usize,
    pub pending: Option<NextQuestion>,
    pub answers_since_save: usize,
    pub checkpoints_saved: usize,
}

impl From<&SessionState> for SessionSnapshot {
    fn from(state: &SessionState) -> Self {
        Self {
            session: state.session.clone(),
            exchange_count: state.exchanges.len(),
            pending: state.pending.clone(),
            answers_since_save: state.answers_since_save,
            checkpoints_saved: state.checkpoints_saved,
        }
    }
}
