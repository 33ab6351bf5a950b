//! Runtime configuration from environment variables

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::worker::ExportSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Where export jobs are queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// The `export_queue` table; survives restarts
    Postgres,
    /// In-process channel; queued jobs are lost on restart
    Memory,
}

impl FromStr for QueueBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(QueueBackend::Postgres),
            "memory" => Ok(QueueBackend::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Maximum pooled database connections
    pub db_max_connections: u32,
    pub db_connect_timeout: Duration,

    /// Bucket that receives export artifacts
    pub export_bucket: String,
    pub export_prefix: String,
    /// Rows per fetched batch and per uploaded part
    pub export_chunk_rows: usize,
    pub presigned_url_ttl: Duration,
    pub job_record_ttl: Duration,

    pub worker_concurrency: usize,
    pub queue_backend: QueueBackend,
    /// Only used by the memory backend
    pub queue_capacity: usize,
    /// A claimed message reappears after this long unless acknowledged
    pub queue_visibility_timeout: Duration,
    pub queue_poll_interval: Duration,
    pub queue_max_attempts: u32,
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; unset and empty values take the default
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        fn parsed<T: FromStr>(
            value: Option<String>,
            name: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match value {
                None => Ok(default),
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { name, value: v }),
            }
        }

        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parsed(get(name), name, default).map(Duration::from_secs)
        };

        let chunk_rows: usize = parsed(get("EXPORT_CHUNK_ROWS"), "EXPORT_CHUNK_ROWS", 30_000)?;
        if chunk_rows == 0 {
            return Err(ConfigError::Invalid {
                name: "EXPORT_CHUNK_ROWS",
                value: "0".into(),
            });
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: parsed(get("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", 10)?,
            db_connect_timeout: secs("DB_CONNECT_TIMEOUT_SECS", 10)?,
            export_bucket: required("EXPORT_BUCKET")?,
            export_prefix: get("EXPORT_PREFIX").unwrap_or_else(|| "exports".to_string()),
            export_chunk_rows: chunk_rows,
            presigned_url_ttl: secs("PRESIGNED_URL_TTL_SECS", 6 * 60 * 60)?,
            job_record_ttl: secs("JOB_RECORD_TTL_SECS", 24 * 60 * 60)?,
            worker_concurrency: parsed(get("WORKER_CONCURRENCY"), "WORKER_CONCURRENCY", 2)?,
            queue_backend: parsed(get("QUEUE_BACKEND"), "QUEUE_BACKEND", QueueBackend::Postgres)?,
            queue_capacity: parsed(get("QUEUE_CAPACITY"), "QUEUE_CAPACITY", 256)?,
            queue_visibility_timeout: secs("QUEUE_VISIBILITY_TIMEOUT_SECS", 60 * 60)?,
            queue_poll_interval: parsed(get("QUEUE_POLL_INTERVAL_MS"), "QUEUE_POLL_INTERVAL_MS", 1_000)
                .map(Duration::from_millis)?,
            queue_max_attempts: parsed(get("QUEUE_MAX_ATTEMPTS"), "QUEUE_MAX_ATTEMPTS", 3)?,
            bind_addr: parsed(
                get("BIND_ADDR"),
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
        })
    }

    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            key_prefix: self.export_prefix.clone(),
            chunk_rows: self.export_chunk_rows,
            url_ttl: self.presigned_url_ttl,
            record_ttl: self.job_record_ttl,
            max_attempts: self.queue_max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("DATABASE_URL", "postgres://localhost/spectral"),
        ("EXPORT_BUCKET", "exports-bucket"),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(REQUIRED)).unwrap();
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.export_prefix, "exports");
        assert_eq!(config.export_chunk_rows, 30_000);
        assert_eq!(config.presigned_url_ttl, Duration::from_secs(21_600));
        assert_eq!(config.job_record_ttl, Duration::from_secs(86_400));
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.queue_backend, QueueBackend::Postgres);
        assert_eq!(config.queue_visibility_timeout, Duration::from_secs(3_600));
        assert_eq!(config.queue_poll_interval, Duration::from_millis(1_000));

        let settings = config.export_settings();
        assert_eq!(settings.chunk_rows, 30_000);
        assert_eq!(settings.object_key("j"), "exports/j.csv");
        assert_eq!(settings.max_attempts, 3);
    }

    #[test]
    fn test_queue_settings() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("QUEUE_BACKEND", "Memory"));
        pairs.push(("QUEUE_VISIBILITY_TIMEOUT_SECS", "900"));
        pairs.push(("QUEUE_MAX_ATTEMPTS", "5"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.queue_backend, QueueBackend::Memory);
        assert_eq!(config.queue_visibility_timeout, Duration::from_secs(900));
        assert_eq!(config.export_settings().max_attempts, 5);

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("QUEUE_BACKEND", "sqs"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "QUEUE_BACKEND", .. }));
    }

    #[test]
    fn test_missing_required() {
        let err = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("EXPORT_BUCKET"));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("EXPORT_CHUNK_ROWS", "500"));
        pairs.push(("BIND_ADDR", "127.0.0.1:9000"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.export_chunk_rows, 500);
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("WORKER_CONCURRENCY", "many"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "WORKER_CONCURRENCY", .. }));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("EXPORT_CHUNK_ROWS", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }
}
