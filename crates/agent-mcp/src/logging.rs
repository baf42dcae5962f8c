//! Tracing setup.
//!
//! Logs go to stderr or to `log.file`, never to stdout: stdout belongs to the
//! stdio transport and any stray byte there corrupts the peer's framing.

use std::ffi::OsStr;
use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LOG_LEVELS};
use crate::error::ConfigError;

/// Default filter directive for `level`.
///
/// Dependencies are held at `warn` unless `debug` is requested.
pub fn filter_directive(level: &str) -> Result<String, ConfigError> {
    let level = level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::UnknownLogLevel(level));
    }
    Ok(match level.as_str() {
        "debug" => "agent_mcp=debug,info".to_string(),
        other => format!("agent_mcp={other},warn"),
    })
}

/// Split `path` into the directory and file name the appender wants.
fn split_log_path(path: &Path) -> anyhow::Result<(&Path, &OsStr)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log file path has no file name: {}", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, file_name))
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, replaces the filter derived from `config.level`.
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the background writer.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<WorkerGuard> {
    let directive = filter_directive(&config.level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let (writer, guard) = match &config.file {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let layer = fmt::layer()
        .with_target(false)
        .with_ansi(config.file.is_none())
        .with_writer(writer);
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(layer.json())
            .try_init()
            .context("failed to install tracing subscriber")?;
    } else {
        registry
            .with(layer)
            .try_init()
            .context("failed to install tracing subscriber")?;
    }

    Ok(guard)
}
