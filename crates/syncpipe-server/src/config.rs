//! Configuration management
//!
//! Process-level settings come from the environment (after `.env` is loaded).
//! Source and job definitions live in a separate TOML file, see
//! [`crate::sync::config`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::orchestrator::RetryPolicy;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/syncpipe";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Sync Engine Constants
// ============================================================================

/// How often the scheduler looks for due jobs.
pub const DEFAULT_SYNC_TICK_INTERVAL_SECS: u64 = 15;

/// First retry delay after a failed run.
pub const DEFAULT_SYNC_BASE_DELAY_SECS: u64 = 30;

/// Upper bound on the exponential retry delay (1 hour).
pub const DEFAULT_SYNC_MAX_DELAY_SECS: u64 = 3600;

pub const DEFAULT_SYNC_MAX_RETRIES: u32 = 5;

/// Wall-clock budget for a single run (30 minutes).
pub const DEFAULT_SYNC_JOB_TIMEOUT_SECS: u64 = 1800;

pub const DEFAULT_SYNC_CACHE_CAPACITY: usize = 1024;

pub const DEFAULT_SYNC_CACHE_TTL_SECS: u64 = 3600;

/// Idempotency records are kept for a week.
pub const DEFAULT_SYNC_IDEMPOTENCY_TTL_SECS: u64 = 7 * 24 * 3600;

pub const DEFAULT_SYNC_EVENT_CAPACITY: usize = 256;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub sync: SyncSettings,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Sync engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Run the scheduler loop; when false the server only answers the ops API
    pub enabled: bool,
    pub tick_interval_secs: u64,
    /// TOML file with `[[sources]]` and `[[jobs]]`
    pub jobs_file: Option<PathBuf>,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_retries: u32,
    pub job_timeout_secs: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub event_capacity: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: std::env::var("SYNCPIPE_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("SYNCPIPE_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "SYNCPIPE_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", false),
            },
            sync: SyncSettings::from_env(),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        self.sync.validate()
    }
}

impl SyncSettings {
    /// Read `SYNC_*` variables, falling back to the `DEFAULT_SYNC_*` constants
    pub fn from_env() -> Self {
        Self {
            enabled: env_or("SYNC_ENABLED", true),
            tick_interval_secs: env_or("SYNC_TICK_INTERVAL_SECS", DEFAULT_SYNC_TICK_INTERVAL_SECS),
            jobs_file: std::env::var("SYNC_JOBS_FILE").ok().map(PathBuf::from),
            base_delay_secs: env_or("SYNC_BASE_DELAY_SECS", DEFAULT_SYNC_BASE_DELAY_SECS),
            max_delay_secs: env_or("SYNC_MAX_DELAY_SECS", DEFAULT_SYNC_MAX_DELAY_SECS),
            max_retries: env_or("SYNC_MAX_RETRIES", DEFAULT_SYNC_MAX_RETRIES),
            job_timeout_secs: env_or("SYNC_JOB_TIMEOUT_SECS", DEFAULT_SYNC_JOB_TIMEOUT_SECS),
            cache_capacity: env_or("SYNC_CACHE_CAPACITY", DEFAULT_SYNC_CACHE_CAPACITY),
            cache_ttl_secs: env_or("SYNC_CACHE_TTL_SECS", DEFAULT_SYNC_CACHE_TTL_SECS),
            idempotency_ttl_secs: env_or(
                "SYNC_IDEMPOTENCY_TTL_SECS",
                DEFAULT_SYNC_IDEMPOTENCY_TTL_SECS,
            ),
            event_capacity: env_or("SYNC_EVENT_CAPACITY", DEFAULT_SYNC_EVENT_CAPACITY),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_secs == 0 {
            anyhow::bail!("SYNC_TICK_INTERVAL_SECS must be greater than 0");
        }
        if self.base_delay_secs > self.max_delay_secs {
            anyhow::bail!(
                "SYNC_BASE_DELAY_SECS ({}) cannot exceed SYNC_MAX_DELAY_SECS ({})",
                self.base_delay_secs,
                self.max_delay_secs
            );
        }
        if self.job_timeout_secs == 0 {
            anyhow::bail!("SYNC_JOB_TIMEOUT_SECS must be greater than 0");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("SYNC_EVENT_CAPACITY must be greater than 0");
        }
        Ok(())
    }

    /// Retry policy applied to jobs that do not declare their own
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: DEFAULT_SYNC_TICK_INTERVAL_SECS,
            jobs_file: None,
            base_delay_secs: DEFAULT_SYNC_BASE_DELAY_SECS,
            max_delay_secs: DEFAULT_SYNC_MAX_DELAY_SECS,
            max_retries: DEFAULT_SYNC_MAX_RETRIES,
            job_timeout_secs: DEFAULT_SYNC_JOB_TIMEOUT_SECS,
            cache_capacity: DEFAULT_SYNC_CACHE_CAPACITY,
            cache_ttl_secs: DEFAULT_SYNC_CACHE_TTL_SECS,
            idempotency_ttl_secs: DEFAULT_SYNC_IDEMPOTENCY_TTL_SECS,
            event_capacity: DEFAULT_SYNC_EVENT_CAPACITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: false,
            },
            sync: SyncSettings::default(),
        }
    }
}
