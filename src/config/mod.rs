//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The Redis URL may carry a password, so it is wrapped in
//! secrecy::SecretString to keep it out of logs.

pub mod secrets;

use crate::error::{Error, Result};
use crate::queue::PopMode;
use crate::worker::WorkerConfig;
use secrecy::SecretString;
use std::time::Duration;

/// Queue name used when `QUEUE_NAME` is unset.
pub const DEFAULT_QUEUE_NAME: &str = "task_queue";

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub queue_name: String,
    pub produce_interval: Duration,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub pop_mode: PopMode,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            queue_name: std::env::var("QUEUE_NAME")
                .unwrap_or_else(|_| DEFAULT_QUEUE_NAME.to_string()),
            produce_interval: millis_var("PRODUCE_INTERVAL_MS", 1000)?,
            poll_interval: millis_var("POLL_INTERVAL_MS", 1000)?,
            retry_backoff: millis_var("RETRY_BACKOFF_MS", 1000)?,
            pop_mode: match std::env::var("POP_MODE") {
                Ok(raw) => raw.parse()?,
                Err(_) => PopMode::default(),
            },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Worker settings derived from this configuration. The produce and
    /// poll intervals belong to the producer and consumer themselves.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            retry_backoff: self.retry_backoff,
            pop_mode: self.pop_mode,
            ..WorkerConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn millis_var(name: &str, default_ms: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| Error::Config(format!("{name} must be a whole number of milliseconds: {e}"))),
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}
