pub mod error;
pub mod logger;
pub mod retry;
pub mod similarity;
pub mod token_estimator;

pub use error::{EngineError, EngineResult, ErrorKind};
pub use similarity::cosine_similarity;
