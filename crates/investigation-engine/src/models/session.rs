use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SessionId;
use crate::utils::error::EngineError;

/// Investigation topics, in the order the controller walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Functionality,
    Users,
    Demographics,
    Design,
    Market,
    Technical,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Functionality,
        Category::Users,
        Category::Demographics,
        Category::Design,
        Category::Market,
        Category::Technical,
    ];

    pub fn first() -> Self {
        Self::ALL[0]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// `None` after the last category
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functionality => "functionality",
            Self::Users => "users",
            Self::Demographics => "demographics",
            Self::Design => "design",
            Self::Market => "market",
            Self::Technical => "technical",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::validation(format!("unknown category '{}'", s)))
    }
}

/// START -> {category}* -> REVIEW -> COMPLETE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ConversationState {
    Start,
    Category(Category),
    Review,
    Complete,
}

impl ConversationState {
    pub fn category(&self) -> Option<Category> {
        match self {
            Self::Category(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// The state after this one. `Complete` is absorbing.
    pub fn successor(&self, review_stage: bool) -> Self {
        match self {
            Self::Start => Self::Category(Category::first()),
            Self::Category(c) => match c.next() {
                Some(next) => Self::Category(next),
                None if review_stage => Self::Review,
                None => Self::Complete,
            },
            Self::Review | Self::Complete => Self::Complete,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Category(c) => f.write_str(c.as_str()),
            Self::Review => f.write_str("review"),
            Self::Complete => f.write_str("complete"),
        }
    }
}

impl From<ConversationState> for String {
    fn from(state: ConversationState) -> Self {
        state.to_string()
    }
}

impl TryFrom<String> for ConversationState {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "start" => Ok(Self::Start),
            "review" => Ok(Self::Review),
            "complete" => Ok(Self::Complete),
            other => other.parse().map(Self::Category),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub state: ConversationState,
    pub skipped_categories: Vec<Category>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: ConversationState::Start,
            skipped_categories: Vec::new(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
        }
    }

    /// Current category, `None` at START, REVIEW and COMPLETE
    pub fn category_pointer(&self) -> Option<Category> {
        self.state.category()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Move to the next state and return it.
    pub fn advance(&mut self, review_stage: bool) -> ConversationState {
        self.state = self.state.successor(review_stage);
        if self.state.is_complete() {
            self.status = SessionStatus::Complete;
        }
        self.touch();
        self.state
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
