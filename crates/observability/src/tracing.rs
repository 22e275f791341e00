//! Tracing/logging initialization.
//!
//! The filter comes from `RUST_LOG` (default `info`); the output format from
//! `PAGEQUEUE_LOG_FORMAT` (`json`, `pretty` or `compact`, default `json`).

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "PAGEQUEUE_LOG_FORMAT";

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    Compact,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown log format `{0}` (expected json, pretty or compact)")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" | "text" => Ok(Self::Compact),
            other => Err(ParseLogFormatError(other.to_string())),
        }
    }
}

impl LogFormat {
    /// Format named by `PAGEQUEUE_LOG_FORMAT`; the default when unset.
    pub fn from_env() -> Result<Self, ParseLogFormatError> {
        Self::from_setting(std::env::var(LOG_FORMAT_ENV).ok().as_deref())
    }

    fn from_setting(raw: Option<&str>) -> Result<Self, ParseLogFormatError> {
        raw.map_or(Ok(Self::default()), |raw| raw.parse())
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops). An unknown
/// `PAGEQUEUE_LOG_FORMAT` falls back to JSON and is reported once logging is up.
pub fn init() {
    let (format, rejected) = match LogFormat::from_env() {
        Ok(format) => (format, None),
        Err(err) => (LogFormat::default(), Some(err)),
    };
    init_with(format, "info");
    if let Some(err) = rejected {
        ::tracing::warn!(variable = LOG_FORMAT_ENV, error = %err, "ignoring unknown log format");
    }
}

/// Initialize with an explicit format; `default_filter` applies when `RUST_LOG` is unset.
///
/// Returns whether this call installed the global subscriber.
pub fn init_with(format: LogFormat, default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    }
    .is_ok();
    if installed {
        ::tracing::debug!(?format, default_filter, "tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn unset_format_is_json_and_unknown_is_reported() {
        assert_eq!(LogFormat::from_setting(None), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_setting(Some("pretty")), Ok(LogFormat::Pretty));
        assert_eq!(
            LogFormat::from_setting(Some("xml")),
            Err(ParseLogFormatError("xml".to_string()))
        );
    }

    #[test]
    fn init_twice_is_harmless() {
        init_with(LogFormat::Compact, "debug");
        assert!(!init_with(LogFormat::Json, "info"));
        ::tracing::info!("still logging");
    }
}
