//! Tracing subscriber setup.

use anyhow::{Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

pub const LOG_FILE_PREFIX: &str = "doc-analyser.log";

/// Build the filter: `RUST_LOG` wins, then `-v`, then the configured level.
pub fn env_filter(config: &LoggingSection, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(format!("doc_analyser={level},tower_http=info,{level}"))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. The returned guard must be held for the
/// life of the process when file logging is enabled, or buffered lines are lost.
pub fn init(config: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(config, verbose);

    if let Some(dir) = &config.directory {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let registry = tracing_subscriber::registry().with(filter);
        let result = if config.json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .try_init()
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .try_init()
        };
        result.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;
        return Ok(Some(guard));
    }

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    result.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;
    Ok(None)
}
