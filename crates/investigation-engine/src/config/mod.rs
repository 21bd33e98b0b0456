pub mod settings;

pub use settings::{
    ActivityConfig, CompletionConfig, ControllerConfig, EmbeddingConfig, RetrievalConfig,
    Settings, StorageConfig,
};
