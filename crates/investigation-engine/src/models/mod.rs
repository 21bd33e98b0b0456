pub mod exchange;
pub mod session;

pub use exchange::{Exchange, ExchangeMetadata};
pub use session::{Category, ConversationState, Session, SessionStatus};

pub type SessionId = String;
pub type ExchangeId = String;
