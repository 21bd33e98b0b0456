pub mod classifier;
pub mod completion_service;
pub mod context_assembler;
pub mod conversation;
pub mod embedding_index;
pub mod embedding_service;
pub mod question;

pub use completion_service::HttpCompletionProvider;
pub use context_assembler::{AssembledContext, ContextAssembler, ContextChunk, ContextMetrics};
pub use conversation::{ConversationController, SessionSnapshot, TurnOutcome};
pub use embedding_index::{AddOutcome, EmbeddingIndex, EmbeddingRecord, IndexStats, SearchHit};
pub use embedding_service::{EmbeddingProvider, HashingEmbeddingProvider, HttpEmbeddingProvider};
pub use question::{NextQuestion, QuestionRenderer, TextCompletionProvider};
