use anyhow::Result;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,investigation_engine=debug";
const FILE_PREFIX: &str = "investigation";

/// Output shape for both the console and the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON; anything else is pretty.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

fn env_filter() -> Result<EnvFilter> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    Ok(EnvFilter::try_new(directives)?)
}

/// `<log_dir>/investigation.<date>.log`, rotated daily.
fn file_appender(log_dir: &Path) -> Result<RollingFileAppender> {
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(FILE_PREFIX)
        .filename_suffix("log")
        .build(log_dir)?)
}

/// Install the global subscriber: console plus the rolling file.
/// Fails if a subscriber is already installed.
pub fn init_logger(log_dir: impl AsRef<Path>) -> Result<()> {
    let file = file_appender(log_dir.as_ref())?;
    let registry = tracing_subscriber::registry().with(env_filter()?);

    match LogFormat::from_env() {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stdout).with_thread_ids(true))
            .with(fmt::layer().json().with_writer(file).with_thread_ids(true))
            .try_init()?,
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stdout))
            .with(fmt::layer().with_writer(file).with_ansi(false))
            .try_init()?,
    }

    Ok(())
}
