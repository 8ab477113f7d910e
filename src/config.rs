use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Messaging configuration loaded from environment variables.
///
/// Connection strings are optional: an unset `DATABASE_URL`, `REDIS_URL` or
/// `KAFKA_BROKERS` makes the binary fall back to the in-memory component.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagingConfig {
    /// Route producers through the outbox instead of publishing directly
    pub use_outbox: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub kafka_brokers: Option<String>,
    /// Topic / queue name, also namespaces session state keys
    pub queue: String,
    pub max_batch_bytes: usize,
    pub dispatch_lease_ttl: Duration,
    pub dispatch_interval: Duration,
    pub max_concurrent_sessions: usize,
    pub metrics_port: u16,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            use_outbox: true,
            database_url: None,
            redis_url: None,
            kafka_brokers: None,
            queue: "health-gateway".to_string(),
            max_batch_bytes: 256 * 1024,
            dispatch_lease_ttl: Duration::from_secs(600),
            dispatch_interval: Duration::from_secs(30),
            max_concurrent_sessions: 8,
            metrics_port: 9090,
        }
    }
}

impl MessagingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            use_outbox: match non_empty("OUTBOX_ENABLED") {
                Some(v) => parse_bool(&v).context("OUTBOX_ENABLED must be true or false")?,
                None => defaults.use_outbox,
            },
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            kafka_brokers: non_empty("KAFKA_BROKERS"),
            queue: non_empty("BUS_QUEUE").unwrap_or(defaults.queue),
            max_batch_bytes: parse_or("BUS_MAX_BATCH_BYTES", non_empty("BUS_MAX_BATCH_BYTES"), defaults.max_batch_bytes)?,
            dispatch_lease_ttl: Duration::from_secs(parse_or(
                "DISPATCH_LEASE_SECS",
                non_empty("DISPATCH_LEASE_SECS"),
                defaults.dispatch_lease_ttl.as_secs(),
            )?),
            dispatch_interval: Duration::from_secs(parse_or(
                "DISPATCH_INTERVAL_SECS",
                non_empty("DISPATCH_INTERVAL_SECS"),
                defaults.dispatch_interval.as_secs(),
            )?),
            max_concurrent_sessions: parse_or(
                "MAX_CONCURRENT_SESSIONS",
                non_empty("MAX_CONCURRENT_SESSIONS"),
                defaults.max_concurrent_sessions,
            )?,
            metrics_port: parse_or("METRICS_PORT", non_empty("METRICS_PORT"), defaults.metrics_port)?,
        })
    }

    /// Messages are published to the in-memory broker, so a receiver in this
    /// process sees them. False once Kafka takes over publishing.
    pub fn receives_in_process(&self) -> bool {
        self.kafka_brokers.is_none()
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, v)),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean {:?}", other),
    }
}
