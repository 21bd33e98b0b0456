use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::validate_session_id;
use crate::models::{Category, Exchange, ExchangeId, ExchangeMetadata, SessionId};
use crate::utils::error::{EngineError, EngineResult};
use crate::utils::retry::{retry_with_backoff, RetryPolicy};

/// Line that terminates every record
pub const DELIMITER: &str = "-----";

const HEADER_PREFIX: &str = "### Exchange ";
const LOG_EXTENSION: &str = "md";

/// Append-only, delimiter-chunked record of every exchange, one file per session.
///
/// Edits never rewrite a file: they append another record with the same
/// exchange id, and [`ExchangeLog::load`] folds the last one written over the
/// original position. Appends per session are serialized, so file order is
/// edit order even when revision numbers restart after a restore.
pub struct ExchangeLog {
    dir: PathBuf,
    retry: RetryPolicy,
    /// Serializes appends per session; different sessions write different files
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl ExchangeLog {
    pub fn new(dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            retry,
            locks: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", session_id, LOG_EXTENSION))
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write one new exchange and return its id.
    pub async fn append(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        metadata: ExchangeMetadata,
    ) -> EngineResult<ExchangeId> {
        let exchange = Exchange {
            id: metadata
                .exchange_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            question: question.to_string(),
            answer: answer.to_string(),
            category: metadata.category,
            timestamp: metadata.timestamp.unwrap_or_else(Utc::now),
            is_followup: metadata.is_followup,
            revision: metadata.revision,
        };
        self.append_exchange(session_id, &exchange).await?;
        Ok(exchange.id)
    }

    /// Write a fully-formed record. Used directly for superseding edits.
    pub async fn append_exchange(&self, session_id: &str, exchange: &Exchange) -> EngineResult<()> {
        validate_session_id(session_id)?;

        let record = render_record(exchange);
        let path = self.path_for(session_id);
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let result = retry_with_backoff(&self.retry, "exchange_log_append", || {
            write_record(&self.dir, &path, &record)
        })
        .await;

        match result {
            Ok(()) => {
                debug!(
                    "Appended exchange {} (rev {}) to session {}",
                    exchange.id, exchange.revision, session_id
                );
                Ok(())
            }
            Err(exhausted) => Err(EngineError::StorageWriteFailure {
                attempts: exhausted.attempts,
                message: exhausted.last_error.to_string(),
            }),
        }
    }

    /// All exchanges of a session in append order, edits applied.
    /// Unknown sessions yield an empty list.
    pub async fn load(&self, session_id: &str) -> EngineResult<Vec<Exchange>> {
        validate_session_id(session_id)?;

        let raw = match fs::read_to_string(self.path_for(session_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::StorageReadFailure(format!(
                    "session {}: {}",
                    session_id, e
                )))
            }
        };

        let mut exchanges: Vec<Exchange> = Vec::new();
        let mut positions: HashMap<ExchangeId, usize> = HashMap::new();

        for chunk in parse(&raw) {
            let record = match parse_record(&chunk) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable record in session {}: {}", session_id, e);
                    continue;
                }
            };

            match positions.get(&record.id) {
                Some(&idx) => {
                    if record.revision < exchanges[idx].revision {
                        debug!(
                            "Exchange {} rewritten at rev {} after rev {}",
                            record.id, record.revision, exchanges[idx].revision
                        );
                    }
                    exchanges[idx] = record;
                }
                None => {
                    positions.insert(record.id.clone(), exchanges.len());
                    exchanges.push(record);
                }
            }
        }

        Ok(exchanges)
    }

    pub async fn exchange_count(&self, session_id: &str) -> EngineResult<usize> {
        Ok(self.load(session_id).await?.len())
    }

    /// Remove a session's log. Returns false if there was none.
    pub async fn delete(&self, session_id: &str) -> EngineResult<bool> {
        validate_session_id(session_id)?;

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let removed = fs::remove_file(self.path_for(session_id)).await;
        self.locks.remove(session_id);

        match removed {
            Ok(()) => {
                info!("Deleted exchange log for session {}", session_id);
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::StorageWriteFailure {
                attempts: 1,
                message: e.to_string(),
            }),
        }
    }

    /// Session ids that have a log on disk, sorted.
    pub async fn list_sessions(&self) -> EngineResult<Vec<SessionId>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::StorageReadFailure(e.to_string())),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::StorageReadFailure(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                sessions.push(stem.to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

async fn write_record(dir: &Path, path: &Path, record: &str) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(record.as_bytes()).await?;
    file.flush().await
}

/// Split raw log text on delimiter lines, dropping blank chunks.
pub fn parse(raw_text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in raw_text.lines() {
        if line.trim_end() == DELIMITER {
            if !current.trim().is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

pub fn render_record(exchange: &Exchange) -> String {
    format!(
        "\n{}{} ({})\n**Question:** {}\n**Answer:** {}\n**Timestamp:** {}\n**Follow-up:** {}\n**Revision:** {}\n{}\n",
        HEADER_PREFIX,
        exchange.id,
        exchange.category_label(),
        escape(&exchange.question),
        escape(&exchange.answer),
        exchange.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        exchange.is_followup,
        exchange.revision,
        DELIMITER,
    )
}

/// Parse one chunk. A torn write from an earlier failed attempt can leave
/// garbage in front of a record, so parsing starts at the last header.
/// Records begin with a newline so a header always starts its own line.
pub fn parse_record(chunk: &str) -> EngineResult<Exchange> {
    let lines: Vec<&str> = chunk.lines().collect();
    let start = lines
        .iter()
        .rposition(|l| l.starts_with(HEADER_PREFIX))
        .ok_or_else(|| EngineError::CorruptRecord("missing exchange header".into()))?;

    let (id, label) = parse_header(&lines[start][HEADER_PREFIX.len()..])?;
    let category = match label {
        "review" => None,
        other => Some(other.parse::<Category>().map_err(|_| {
            EngineError::CorruptRecord(format!("unknown category '{}'", other))
        })?),
    };

    let mut question = None;
    let mut answer = None;
    let mut timestamp = None;
    let mut is_followup = false;
    let mut revision = 0;

    for line in &lines[start + 1..] {
        if let Some(v) = field(line, "**Question:**") {
            question = Some(unescape(v));
        } else if let Some(v) = field(line, "**Answer:**") {
            answer = Some(unescape(v));
        } else if let Some(v) = field(line, "**Timestamp:**") {
            let ts = DateTime::parse_from_rfc3339(v.trim())
                .map_err(|e| EngineError::CorruptRecord(format!("bad timestamp '{}': {}", v, e)))?;
            timestamp = Some(ts.with_timezone(&Utc));
        } else if let Some(v) = field(line, "**Follow-up:**") {
            is_followup = v.trim() == "true";
        } else if let Some(v) = field(line, "**Revision:**") {
            revision = v
                .trim()
                .parse()
                .map_err(|_| EngineError::CorruptRecord(format!("bad revision '{}'", v)))?;
        }
    }

    let missing = |field: &str| EngineError::CorruptRecord(format!("exchange {} has no {}", id, field));
    Ok(Exchange {
        id: id.to_string(),
        question: question.ok_or_else(|| missing("question"))?,
        answer: answer.ok_or_else(|| missing("answer"))?,
        category,
        timestamp: timestamp.ok_or_else(|| missing("timestamp"))?,
        is_followup,
        revision,
    })
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)
        .map(|v| v.strip_prefix(' ').unwrap_or(v))
}

fn parse_header(rest: &str) -> EngineResult<(&str, &str)> {
    let rest = rest.trim_end();
    let open = rest
        .rfind(" (")
        .ok_or_else(|| EngineError::CorruptRecord(format!("bad header '{}'", rest)))?;
    let label = rest[open + 2..]
        .strip_suffix(')')
        .ok_or_else(|| EngineError::CorruptRecord(format!("bad header '{}'", rest)))?;
    let id = rest[..open].trim();
    if id.is_empty() {
        return Err(EngineError::CorruptRecord("empty exchange id".into()));
    }
    Ok((id, label))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
