use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::Category;

/// Activity type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    SessionCreated,
    AnswerRecorded,
    FollowupRequested,
    CategoryAdvanced,
    CategorySkipped,
    AnswerEdited,
    ContextRetrieved,
    ContextFallback,
    CheckpointSaved,
    CheckpointFailed,
    SessionCompleted,
    SessionRestored,
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionCreated => "session_created",
            Self::AnswerRecorded => "answer_recorded",
            Self::FollowupRequested => "followup_requested",
            Self::CategoryAdvanced => "category_advanced",
            Self::CategorySkipped => "category_skipped",
            Self::AnswerEdited => "answer_edited",
            Self::ContextRetrieved => "context_retrieved",
            Self::ContextFallback => "context_fallback",
            Self::CheckpointSaved => "checkpoint_saved",
            Self::CheckpointFailed => "checkpoint_failed",
            Self::SessionCompleted => "session_completed",
            Self::SessionRestored => "session_restored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

/// One line of the activity journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub session_id: String,
    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    // Metrics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_fields: HashMap<String, Value>,
}

impl ActivityLog {
    pub fn builder(session_id: impl Into<String>, activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(session_id.into(), activity_type)
    }
}

pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(session_id: String, activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                session_id,
                activity_type,
                activity_status: ActivityStatus::Success,
                exchange_id: None,
                category: None,
                message: None,
                chunk_count: None,
                token_count: None,
                processing_time_ms: None,
                error_message: None,
                error_type: None,
                created_at: Utc::now(),
                custom_fields: HashMap::new(),
            },
        }
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn exchange_id(mut self, id: impl Into<String>) -> Self {
        self.log.exchange_id = Some(id.into());
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.log.category = Some(category);
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message = Some(content.into());
        self
    }

    pub fn chunk_count(mut self, count: usize) -> Self {
        self.log.chunk_count = Some(count);
        self
    }

    pub fn token_count(mut self, count: usize) -> Self {
        self.log.token_count = Some(count);
        self
    }

    pub fn processing_time(mut self, ms: u64) -> Self {
        self.log.processing_time_ms = Some(ms);
        self
    }

    pub fn error(mut self, message: impl Into<String>, error_type: impl Into<String>) -> Self {
        self.log.error_message = Some(message.into());
        self.log.error_type = Some(error_type.into());
        self.log.activity_status = ActivityStatus::Error;
        self
    }

    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.log.custom_fields.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
