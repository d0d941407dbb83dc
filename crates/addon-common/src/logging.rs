//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing setup for add-on manager hosts."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive read before `RUST_LOG`.
pub const LOG_ENV: &str = "ADDON_LOG";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Output format of the stdout sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the process-wide subscriber described by `config`.
///
/// Stdout always receives events in [`LoggingConfig::format`]. When
/// [`LoggingConfig::directory`] is set, a daily rolling JSON file named after
/// `file_prefix` (or `service_name`) is written there as well. Only the first
/// call installs a subscriber; later calls leave it in place.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(&config.level);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let mut guards = vec![stdout_guard];

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).with_context(|| {
                format!("unable to create log directory {}", directory.display())
            })?;
            let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
            let (file_writer, file_guard) =
                tracing_appender::non_blocking(daily(directory, format!("{prefix}.log")));
            guards.push(file_guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set(guards);
        info!(
            service = %service_name,
            log_dir = ?config.directory,
            format = ?config.format,
            "tracing initialised"
        );
    } else {
        debug!(service = %service_name, "tracing already initialised; keeping existing subscriber");
    }
    Ok(())
}

fn env_filter(fallback: &str) -> EnvFilter {
    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        fallback,
    );
    EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter {directive:?} ({err}); using {fallback:?}");
        EnvFilter::try_new(fallback).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// `ADDON_LOG` wins over `RUST_LOG`, which wins over the configured level.
fn filter_directive(addon_log: Option<String>, rust_log: Option<String>, fallback: &str) -> String {
    [addon_log, rust_log]
        .into_iter()
        .flatten()
        .find(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addon_log_takes_precedence() {
        assert_eq!(
            filter_directive(Some("addon_core=trace".into()), Some("warn".into()), "info"),
            "addon_core=trace"
        );
        assert_eq!(filter_directive(None, Some("warn".into()), "info"), "warn");
        assert_eq!(filter_directive(Some(" ".into()), None, "debug"), "debug");
        assert_eq!(filter_directive(None, None, "info"), "info");
    }

    #[test]
    fn file_sink_creates_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(dir.path().join("logs")),
            format: LogFormat::Pretty,
            file_prefix: Some("addon-test".into()),
            ..LoggingConfig::default()
        };
        init_tracing("addon-manager", &config).unwrap();
        init_tracing("addon-manager", &config).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn stdout_only_needs_no_directory() {
        let config = LoggingConfig {
            level: "addon_core=debug,warn".into(),
            ..LoggingConfig::default()
        };
        assert!(config.directory.is_none());
        init_tracing("addon-manager", &config).unwrap();
    }
}
