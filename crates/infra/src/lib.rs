//! Infrastructure layer: queue persistence, scheduling, worker transport, config.

pub mod config;
pub mod queue;

pub use config::{ConfigError, QueueConfig};
