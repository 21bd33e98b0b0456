use thiserror::Error;

/// How a caller should react to a failure, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// External dependency hiccup, retrying later may succeed
    Transient,
    /// The request itself is wrong (unknown id, empty answer, ...)
    InvalidRequest,
    /// Durable state could not be written or read back
    Unrecoverable,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Exchange {exchange_id} not found in session {session_id}")]
    ExchangeNotFound {
        session_id: String,
        exchange_id: String,
    },

    #[error("Session {0} is already complete")]
    SessionComplete(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Embedding error: {0}")]
    EmbeddingFailure(String),

    #[error("Embedding timed out after {0} seconds")]
    EmbeddingTimeout(u64),

    #[error("Storage write failed after {attempts} attempts: {message}")]
    StorageWriteFailure { attempts: u32, message: String },

    #[error("Storage read failed: {0}")]
    StorageReadFailure(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmbeddingFailure(_) | Self::EmbeddingTimeout(_) => ErrorKind::Transient,
            Self::SessionNotFound(_)
            | Self::ExchangeNotFound { .. }
            | Self::SessionComplete(_)
            | Self::Validation(_) => ErrorKind::InvalidRequest,
            Self::StorageWriteFailure { .. }
            | Self::StorageReadFailure(_)
            | Self::CorruptRecord(_)
            | Self::DimensionMismatch { .. } => ErrorKind::Unrecoverable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::CorruptRecord(err.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
