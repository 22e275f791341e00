//! Process configuration for the API binary.

use std::net::SocketAddr;

use thiserror::Error;
use tracing::warn;

use pagequeue_infra::{ConfigError, QueueConfig};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://pagequeue.db";
pub const DEFAULT_WORKER_URL: &str = "http://127.0.0.1:8090/dispatch";

#[derive(Debug, Error)]
pub enum ApiConfigError {
    #[error("invalid BIND_ADDR `{0}`")]
    BindAddr(String),
    #[error(transparent)]
    Queue(#[from] ConfigError),
}

/// Everything `main` needs to wire the service.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// SQLite connection string of the queue store
    pub database_url: String,
    /// Endpoint the worker accepts dispatches on
    pub worker_url: String,
    pub queue: QueueConfig,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ApiConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ApiConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_addr = lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_addr
            .parse()
            .map_err(|_| ApiConfigError::BindAddr(raw_addr.clone()))?;

        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| {
            warn!("DATABASE_URL not set; using {DEFAULT_DATABASE_URL}");
            DEFAULT_DATABASE_URL.to_string()
        });
        let worker_url = lookup("WORKER_URL").unwrap_or_else(|| {
            warn!("WORKER_URL not set; using {DEFAULT_WORKER_URL}");
            DEFAULT_WORKER_URL.to_string()
        });

        Ok(Self {
            bind_addr,
            database_url,
            worker_url,
            queue: QueueConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let config = ApiConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn rejects_bad_bind_addr() {
        let err = ApiConfig::from_lookup(|key| (key == "BIND_ADDR").then(|| "nope".to_string())).unwrap_err();
        assert!(matches!(err, ApiConfigError::BindAddr(_)));
    }

    #[test]
    fn queue_errors_propagate() {
        let err = ApiConfig::from_lookup(|key| (key == "PAGEQUEUE_BATCH_SIZE").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ApiConfigError::Queue(_)));
    }
}
