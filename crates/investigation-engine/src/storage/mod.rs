//! Durable storage: the per-session exchange log and session checkpoints

pub mod checkpoint;
pub mod exchange_log;

pub use checkpoint::{CheckpointStore, CheckpointSummary, SessionCheckpoint};
pub use exchange_log::ExchangeLog;

use crate::utils::error::{EngineError, EngineResult};

/// Session ids become file names, so they must not escape the storage dir.
pub(crate) fn validate_session_id(session_id: &str) -> EngineResult<()> {
    let bad = session_id.is_empty()
        || session_id.len() > 128
        || session_id.contains(['/', '\\'])
        || session_id.starts_with('.');
    if bad {
        return Err(EngineError::validation(format!(
            "invalid session id '{}'",
            session_id
        )));
    }
    Ok(())
}
