//! HTTP API: control surface of the page queue plus the background alarm.

pub mod app;
pub mod config;
pub mod middleware;
