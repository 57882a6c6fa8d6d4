//! Tracing setup shared by every `scm-sync` role.
//!
//! Each process installs one subscriber writing to stderr, so `--json`
//! output on stdout stays machine readable. The command a process runs is
//! recorded on a root [`role_span`] and therefore on every event it emits.

use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tracing::Span;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Store drivers that are chatty at `info`; held at `warn` unless `RUST_LOG`
/// says otherwise.
const QUIET_TARGETS: &[&str] = &["sqlx", "sea_orm", "sea_orm_migration"];

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
    #[error("invalid log filter '{directives}': {message}")]
    Filter { directives: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON, the production format.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" | "text" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(level: &str) -> String {
    let level = level.trim();
    let level = if level.is_empty() { "info" } else { level };
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.join(",")
}

/// Root span for one CLI role; instrument the role's future with it.
pub fn role_span(role: &'static str) -> Span {
    tracing::info_span!("scm_sync", role, pid = std::process::id())
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the global subscriber once per process. Later calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives = default_directives(&config.log_level);
            EnvFilter::try_new(&directives).map_err(|err| {
                INSTALLED.store(false, Ordering::SeqCst);
                TelemetryInitError::Filter {
                    directives,
                    message: err.to_string(),
                }
            })?
        }
    };

    // sqlx reports through `log`; a bridge installed earlier (tests) is fine.
    let _ = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init();

    let layer = match LogFormat::parse(&config.log_format) {
        LogFormat::Pretty => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
    {
        INSTALLED.store(false, Ordering::SeqCst);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing_defaults_to_json() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(" Compact "), LogFormat::Compact);
        assert_eq!(LogFormat::parse("text"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
    }

    #[test]
    fn default_directives_quiet_store_drivers() {
        assert_eq!(
            default_directives("debug"),
            "debug,sqlx=warn,sea_orm=warn,sea_orm_migration=warn"
        );
        assert!(default_directives("  ").starts_with("info,"));
        assert!(EnvFilter::try_new(default_directives("scm_sync=trace")).is_ok());
    }
}
