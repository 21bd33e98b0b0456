use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Category, ExchangeId};

/// One question/answer pair. `category` is `None` for the review question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ExchangeId,
    pub question: String,
    pub answer: String,
    pub category: Option<Category>,
    pub timestamp: DateTime<Utc>,
    pub is_followup: bool,
    /// Bumped by every edit; 0 for the original answer
    #[serde(default)]
    pub revision: u32,
}

impl Exchange {
    /// Text that gets embedded and handed back as context
    pub fn chunk_text(&self) -> String {
        format!("Q: {}\nA: {}", self.question, self.answer)
    }

    pub fn category_label(&self) -> &'static str {
        self.category.map(|c| c.as_str()).unwrap_or("review")
    }
}

/// Everything `ExchangeLog::append` needs besides the question and answer.
#[derive(Debug, Clone, Default)]
pub struct ExchangeMetadata {
    /// Generated when absent
    pub exchange_id: Option<ExchangeId>,
    pub category: Option<Category>,
    pub is_followup: bool,
    /// Defaults to now
    pub timestamp: Option<DateTime<Utc>>,
    pub revision: u32,
}

impl ExchangeMetadata {
    pub fn new(category: Option<Category>, is_followup: bool) -> Self {
        Self {
            category,
            is_followup,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<ExchangeId>) -> Self {
        self.exchange_id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }
}
