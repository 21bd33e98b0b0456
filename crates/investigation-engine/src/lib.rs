//! Conversational product-investigation engine.
//!
//! A [`ConversationController`] walks each session through six investigation
//! categories, appends every exchange to a plain-text log, indexes exchanges
//! for semantic retrieval and checkpoints session state to disk.

pub mod config;
pub mod logging;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::Settings;
pub use logging::ActivityLogger;
pub use models::{Category, ConversationState, Exchange, Session, SessionId};
pub use services::{ConversationController, NextQuestion, TurnOutcome};
pub use utils::{EngineError, EngineResult, ErrorKind};
