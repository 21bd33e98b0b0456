use anyhow::{Context, Result};
use chrono::Utc;
use flume::{bounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::ActivityLog;
use crate::config::ActivityConfig;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Max logs held in memory before new ones are dropped
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Max wait before flushing a partial batch (milliseconds)
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
    pub dir: PathBuf,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 1,
            dir: PathBuf::from("./data/activity"),
        }
    }
}

impl From<&ActivityConfig> for LoggerConfig {
    fn from(cfg: &ActivityConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity.max(1),
            batch_size: cfg.batch_size.max(1),
            batch_timeout_ms: cfg.batch_timeout_ms,
            worker_count: cfg.worker_count.max(1),
            dir: cfg.dir.clone(),
        }
    }
}

/// Async activity journal. Cloning shares the same queue.
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Option<Sender<ActivityLog>>,
}

impl ActivityLogger {
    /// Spawn background workers. Must be called inside a tokio runtime.
    pub fn new(config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing ActivityLogger: dir={}, queue={}, batch={}, timeout={}ms, workers={}",
            config.dir.display(),
            config.queue_capacity,
            config.batch_size,
            config.batch_timeout_ms,
            config.worker_count
        );

        for worker_id in 0..config.worker_count {
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, receiver, config).await;
            });
        }

        Self {
            sender: Some(sender),
        }
    }

    pub fn from_settings(cfg: &ActivityConfig) -> Self {
        if cfg.enabled {
            Self::new(LoggerConfig::from(cfg))
        } else {
            Self::disabled()
        }
    }

    /// A logger that accepts and discards everything.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Non-blocking; drops the entry with a warning when the queue is full.
    pub fn log(&self, activity: ActivityLog) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    async fn worker_loop(worker_id: usize, receiver: Receiver<ActivityLog>, config: LoggerConfig) {
        debug!("Activity worker {} started", worker_id);

        let mut batch: Vec<ActivityLog> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(log)) => batch.push(log),
                    Ok(Err(_)) => {
                        // Channel closed, flush and exit
                        if !batch.is_empty() {
                            Self::flush_batch(&config.dir, &batch, worker_id).await;
                        }
                        debug!("Activity worker {} shutting down (channel closed)", worker_id);
                        return;
                    }
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(&config.dir, &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(50)).await;
            }
        }
    }

    async fn flush_batch(dir: &Path, batch: &[ActivityLog], worker_id: usize) {
        match Self::append_batch(dir, batch).await {
            Ok(written) => debug!("Activity worker {} wrote {} entries", worker_id, written),
            Err(e) => error!("Activity worker {} failed to write batch: {:#}", worker_id, e),
        }
    }

    async fn append_batch(dir: &Path, logs: &[ActivityLog]) -> Result<usize> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let path = dir.join(format!("activity-{}.jsonl", Utc::now().format("%Y-%m-%d")));

        let mut buf = String::new();
        for log in logs {
            buf.push_str(&serde_json::to_string(log)?);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        Ok(logs.len())
    }

    pub fn queue_len(&self) -> usize {
        self.sender.as_ref().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::ActivityType;

    #[tokio::test]
    async fn test_disabled_logger_is_noop() {
        let logger = ActivityLogger::disabled();
        assert!(!logger.is_enabled());
        logger.log(ActivityLog::builder("s", ActivityType::SessionCreated).build());
        assert_eq!(logger.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_batches_are_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ActivityLogger::new(LoggerConfig {
            batch_timeout_ms: 20,
            dir: dir.path().to_path_buf(),
            ..LoggerConfig::default()
        });

        for _ in 0..3 {
            logger.log(ActivityLog::builder("s-1", ActivityType::AnswerRecorded).build());
        }

        let mut lines = 0;
        for _ in 0..100 {
            sleep(Duration::from_millis(20)).await;
            let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
            lines = 0;
            while let Some(entry) = entries.next_entry().await.unwrap() {
                let content = tokio::fs::read_to_string(entry.path()).await.unwrap();
                lines += content.lines().count();
            }
            if lines == 3 {
                break;
            }
        }
        assert_eq!(lines, 3);
    }
}
