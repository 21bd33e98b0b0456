//! Conversation control: the per-session state machine and its registry
//!
//! - Session registry (DashMap, one tokio mutex per session)
//! - Category progression with follow-up, skip and edit
//! - Auto and manual checkpoints

pub mod manager;
mod registry;
pub mod types;

pub use manager::ConversationController;
pub use registry::{SessionHandle, SessionRegistry};
pub use types::{SessionSnapshot, SessionState, TurnOutcome};
