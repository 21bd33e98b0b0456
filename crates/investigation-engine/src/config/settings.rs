use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::retry::RetryPolicy;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_conversation_dir")]
    pub conversation_dir: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize, // 384 untuk AllMiniLML6V2
    #[serde(default = "default_external_timeout")]
    pub timeout_seconds: u64,
}

/// Optional LLM that rewords template questions. The call itself is bounded
/// by `controller.external_timeout_seconds`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CompletionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_completion_url")]
    pub base_url: String,
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default = "default_dedup_prefix_chars")]
    pub dedup_prefix_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerConfig {
    /// Answers shorter than this many words get a follow-up in the same category.
    /// Word count is a weak proxy for answer completeness.
    #[serde(default = "default_followup_word_threshold")]
    pub followup_word_threshold: usize,
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval: usize,
    #[serde(default)]
    pub review_stage: bool,
    /// Also follow up on long answers that hedge ("not sure", "maybe").
    /// Off by default: only word count decides.
    #[serde(default)]
    pub vague_answer_followup: bool,
    #[serde(default = "default_external_timeout")]
    pub external_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ActivityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_activity_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_conversation_dir() -> PathBuf {
    PathBuf::from("./data/conversations")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_activity_dir() -> PathBuf {
    PathBuf::from("./data/activity")
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    2_000
}

fn default_embedding_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}

fn default_completion_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_completion_max_tokens() -> usize {
    64
}

fn default_temperature() -> f32 {
    0.7
}

fn default_dimension() -> usize {
    384
}

fn default_external_timeout() -> u64 {
    10
}

fn default_top_k() -> usize {
    5
}

fn default_max_tokens() -> usize {
    4_000
}

fn default_recency_weight() -> f32 {
    0.3
}

fn default_dedup_threshold() -> f32 {
    0.95
}

fn default_overfetch_factor() -> usize {
    3
}

fn default_dedup_prefix_chars() -> usize {
    200
}

fn default_followup_word_threshold() -> usize {
    15
}

fn default_auto_save_interval() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    1_000
}

fn default_worker_count() -> usize {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            conversation_dir: default_conversation_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            log_dir: default_log_dir(),
            write_retries: default_write_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl StorageConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.write_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_url(),
            model: default_embedding_model(),
            dimension: default_dimension(),
            timeout_seconds: default_external_timeout(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_completion_url(),
            max_tokens: default_completion_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
            recency_weight: default_recency_weight(),
            dedup_threshold: default_dedup_threshold(),
            overfetch_factor: default_overfetch_factor(),
            dedup_prefix_chars: default_dedup_prefix_chars(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            followup_word_threshold: default_followup_word_threshold(),
            auto_save_interval: default_auto_save_interval(),
            review_stage: false,
            vague_answer_followup: false,
            external_timeout_seconds: default_external_timeout(),
        }
    }
}

impl ControllerConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_seconds)
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_activity_dir(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            worker_count: default_worker_count(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            // Example: APP_RETRIEVAL__TOP_K=4
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.recency_weight) {
            anyhow::bail!("retrieval.recency_weight must be in [0, 1], got {}", r.recency_weight);
        }
        if r.dedup_threshold <= 0.0 || r.dedup_threshold > 1.0 {
            anyhow::bail!(
                "retrieval.dedup_threshold must be in (0, 1], got {}",
                r.dedup_threshold
            );
        }
        if r.overfetch_factor == 0 {
            anyhow::bail!("retrieval.overfetch_factor must be at least 1");
        }
        if self.controller.auto_save_interval == 0 {
            anyhow::bail!("controller.auto_save_interval must be at least 1");
        }
        if self.embedding.dimension == 0 {
            anyhow::bail!("embedding.dimension must be non-zero");
        }
        if self.controller.external_timeout_seconds == 0 || self.embedding.timeout_seconds == 0 {
            anyhow::bail!("timeouts must be at least one second");
        }
        Ok(())
    }
}
