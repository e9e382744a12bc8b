//! Configuration module
//!
//! Settings are read from environment variables (optionally seeded from a
//! `.env` file). [`Config::from_source`] takes an arbitrary lookup so tests can
//! build a configuration without touching the process environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

// Common constants
const SERVER_PORT: u16 = 8080;
const MAX_CONNECTIONS: u32 = 10;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const HTTP_CONCURRENCY_LIMIT: usize = 1024;
const SMTP_TIMEOUT_SECS: u64 = 30;
const MEMORY_CAPACITY: usize = 10_000;
const MEMORY_RETAIN_FINISHED: usize = 10_000;
const WORKER_COUNT: usize = 5;
const BATCH_SIZE: i64 = 10;
const MAX_RETRIES: i32 = 3;
const POLL_INTERVAL_MS: u64 = 1000;
const DELIVERY_TIMEOUT_SECS: u64 = 60;
const LEASE_TIMEOUT_SECS: u64 = 600;
const REAP_INTERVAL_SECS: u64 = 60;
/// Minimum headroom between a delivery timing out and its lease expiring.
const LEASE_MARGIN_SECS: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("Invalid LOG_FORMAT: {}", other)),
        }
    }
}

/// How the relay connection is secured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpTls {
    /// Plain connection upgraded with STARTTLS
    StartTls,
    /// TLS from the first byte (SMTPS)
    Tls,
    /// No encryption. Only for local relays and tests.
    None,
}

impl FromStr for SmtpTls {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starttls" | "true" => Ok(SmtpTls::StartTls),
            "tls" | "smtps" => Ok(SmtpTls::Tls),
            "none" | "false" => Ok(SmtpTls::None),
            other => Err(anyhow::anyhow!("Invalid SMTP_TLS: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueBackend {
    Postgres,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(QueueBackend::Postgres),
            "memory" | "in-memory" => Ok(QueueBackend::Memory),
            other => Err(anyhow::anyhow!("Invalid QUEUE_BACKEND: {}", other)),
        }
    }
}

/// Server-level settings
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub environment: String,
    pub log_format: LogFormat,
    pub max_body_bytes: usize,
    pub http_concurrency_limit: usize,
}

/// Outbound relay settings
#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Sender address. Defaults to the login user.
    pub from: String,
    pub tls: SmtpTls,
    pub timeout_secs: u64,
}

/// Storage and worker pool settings
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub memory_capacity: usize,
    /// Sent and dead tasks the memory backend keeps readable.
    pub memory_retain_finished: usize,
    pub worker_count: usize,
    pub batch_size: i64,
    pub max_retries: i32,
    pub poll_interval_ms: u64,
    pub delivery_timeout_secs: u64,
    /// 0 disables the lease sweeper.
    pub lease_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub dead_letter_enabled: bool,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub base: BaseConfig,
    pub smtp: SmtpConfig,
    pub queue: QueueConfig,
}

fn required<F>(lookup: &F, key: &str) -> Result<String, anyhow::Error>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("{} must be set", key))
}

fn parsed_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, anyhow::Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {} ({})", key, raw, e)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup. Required SMTP settings missing
    /// or malformed values are reported as errors.
    pub fn from_source<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let user = required(&lookup, "SMTP_USER")?;
        let password = lookup("SMTP_PASS")
            .filter(|v| !v.is_empty())
            .or_else(|| lookup("SMTP_PASSWORD").filter(|v| !v.is_empty()))
            .ok_or_else(|| anyhow::anyhow!("SMTP_PASS must be set"))?;

        let smtp = SmtpConfig {
            host: required(&lookup, "SMTP_HOST")?,
            port: required(&lookup, "SMTP_PORT")?
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid SMTP_PORT: {}", e))?,
            from: lookup("SMTP_FROM")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| user.clone()),
            user,
            password,
            tls: parsed_or(&lookup, "SMTP_TLS", SmtpTls::StartTls)?,
            timeout_secs: parsed_or(&lookup, "SMTP_TIMEOUT_SECS", SMTP_TIMEOUT_SECS)?,
        };

        let base = BaseConfig {
            server_port: parsed_or(&lookup, "PORT", SERVER_PORT)?,
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            log_format: parsed_or(&lookup, "LOG_FORMAT", LogFormat::Text)?,
            max_body_bytes: parsed_or(&lookup, "MAX_BODY_BYTES", MAX_BODY_BYTES)?,
            http_concurrency_limit: parsed_or(
                &lookup,
                "HTTP_CONCURRENCY_LIMIT",
                HTTP_CONCURRENCY_LIMIT,
            )?,
        };

        let queue = QueueConfig {
            backend: parsed_or(&lookup, "QUEUE_BACKEND", QueueBackend::Postgres)?,
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            db_max_connections: parsed_or(&lookup, "DB_MAX_CONNECTIONS", MAX_CONNECTIONS)?,
            db_timeout_seconds: parsed_or(&lookup, "DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS)?,
            memory_capacity: parsed_or(&lookup, "QUEUE_MEMORY_CAPACITY", MEMORY_CAPACITY)?,
            memory_retain_finished: parsed_or(
                &lookup,
                "QUEUE_MEMORY_RETAIN_FINISHED",
                MEMORY_RETAIN_FINISHED,
            )?,
            worker_count: parsed_or(&lookup, "WORKER_COUNT", WORKER_COUNT)?,
            batch_size: parsed_or(&lookup, "BATCH_SIZE", BATCH_SIZE)?,
            max_retries: parsed_or(&lookup, "MAX_RETRIES", MAX_RETRIES)?,
            poll_interval_ms: parsed_or(&lookup, "POLL_INTERVAL_MS", POLL_INTERVAL_MS)?,
            delivery_timeout_secs: parsed_or(
                &lookup,
                "DELIVERY_TIMEOUT_SECS",
                DELIVERY_TIMEOUT_SECS,
            )?,
            lease_timeout_secs: parsed_or(&lookup, "LEASE_TIMEOUT_SECS", LEASE_TIMEOUT_SECS)?,
            reap_interval_secs: parsed_or(&lookup, "REAP_INTERVAL_SECS", REAP_INTERVAL_SECS)?,
            dead_letter_enabled: parsed_or(&lookup, "DEAD_LETTER_ENABLED", true)?,
        };

        Ok(Config { base, smtp, queue })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let queue = &self.queue;

        if queue.worker_count == 0 {
            return Err(anyhow::anyhow!("WORKER_COUNT must be at least 1"));
        }

        if queue.batch_size <= 0 {
            return Err(anyhow::anyhow!("BATCH_SIZE must be at least 1"));
        }

        if queue.max_retries < 0 {
            return Err(anyhow::anyhow!("MAX_RETRIES must not be negative"));
        }

        if queue.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("POLL_INTERVAL_MS must be greater than 0"));
        }

        if queue.delivery_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "DELIVERY_TIMEOUT_SECS must be greater than 0"
            ));
        }

        if queue.lease_timeout_secs > 0
            && queue.lease_timeout_secs < queue.delivery_timeout_secs + LEASE_MARGIN_SECS
        {
            return Err(anyhow::anyhow!(
                "LEASE_TIMEOUT_SECS must exceed DELIVERY_TIMEOUT_SECS by at least {}s",
                LEASE_MARGIN_SECS
            ));
        }

        if queue.lease_timeout_secs > 0 && queue.reap_interval_secs == 0 {
            return Err(anyhow::anyhow!("REAP_INTERVAL_SECS must be greater than 0"));
        }

        match queue.backend {
            QueueBackend::Postgres => {
                let url = queue.database_url.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("DATABASE_URL must be set when QUEUE_BACKEND=postgres")
                })?;
                if !(url.starts_with("postgresql://") || url.starts_with("postgres://")) {
                    return Err(anyhow::anyhow!(
                        "DATABASE_URL must be a valid PostgreSQL connection string"
                    ));
                }
            }
            QueueBackend::Memory => {
                if queue.memory_capacity == 0 {
                    return Err(anyhow::anyhow!(
                        "QUEUE_MEMORY_CAPACITY must be greater than 0"
                    ));
                }
            }
        }

        if self.base.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("MAX_BODY_BYTES must be greater than 0"));
        }

        Ok(())
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = &self.base.environment;
        env.eq_ignore_ascii_case("production") || env.eq_ignore_ascii_case("prod")
    }

    pub fn server_port(&self) -> u16 {
        self.base.server_port
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.delivery_timeout_secs)
    }

    /// Lease after which a claimed task is handed back to the pool, if leasing is enabled.
    pub fn lease_timeout(&self) -> Option<Duration> {
        match self.queue.lease_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.queue.reap_interval_secs)
    }
}
