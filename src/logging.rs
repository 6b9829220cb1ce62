//! Tracing setup: a daily rolling log file plus stderr.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingSettings;

const DEFAULT_FILTER: &str = "info,agent_relay=debug";
const LOG_FILE: &str = "agent-relay.log";

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process; dropping it flushes and closes the file writer.
pub fn init(settings: &LoggingSettings) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = log_dir(settings)?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE));

    let file_layer = if settings.json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter(settings)?)
        .with(file_layer)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    tracing::debug!("Logging to {} (json: {})", log_dir.display(), settings.json);
    Ok((guard, log_dir))
}

fn filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = directives(settings);
    EnvFilter::try_new(directives).with_context(|| format!("invalid log filter '{}'", directives))
}

fn directives(settings: &LoggingSettings) -> &str {
    settings
        .filter
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_FILTER)
}

fn log_dir(settings: &LoggingSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.directory {
        return Ok(dir.clone());
    }
    let dirs = directories::ProjectDirs::from("com", "agent-relay", "agent-relay")
        .context("could not determine data directory")?;
    Ok(dirs.data_dir().join("logs"))
}

/// Console-only logging for tests. Safe to call from every test.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        assert_eq!(directives(&LoggingSettings::default()), DEFAULT_FILTER);

        let blank = LoggingSettings {
            filter: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(directives(&blank), DEFAULT_FILTER);

        let custom = LoggingSettings {
            filter: Some("warn,agent_relay::core=trace".to_string()),
            ..Default::default()
        };
        assert_eq!(directives(&custom), "warn,agent_relay::core=trace");
        assert!(EnvFilter::try_new(directives(&custom)).is_ok());
    }

    #[test]
    fn test_configured_log_dir_wins() {
        let settings = LoggingSettings {
            directory: Some(PathBuf::from("/var/log/relay")),
            ..Default::default()
        };
        assert_eq!(log_dir(&settings).unwrap(), PathBuf::from("/var/log/relay"));
        assert!(log_dir(&LoggingSettings::default()).unwrap().ends_with("logs"));
    }
}
