//! Engine configuration.
//!
//! [`EngineConfig`] bundles the database location, the connection pool
//! settings, whether the schema should be provisioned at startup, and the
//! worker timings. [`DbConfig::from_env`] reads the database location from
//! the environment (and a `.env` file, if present).

use crate::storage::ClaimOrder;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default pool size for the Postgres connection pool.
const DEFAULT_POOL_SIZE: u32 = 20;

/// Default connection timeout in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Default worker poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default lease granted to a worker that claims a run.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Default delay before a run released after a transient fault is retried.
/// Doubles with every further release.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default number of releases after which a run is failed instead.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Location and credentials of the Postgres database backing the run store.
#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            database: database.into(),
        }
    }

    /// Reads the configuration from `WAYPOST_DB_*` environment variables.
    ///
    /// A `.env` file in the working directory (or any parent) is loaded
    /// first; variables already set in the process environment win.
    ///
    /// | Variable              | Default     |
    /// |-----------------------|-------------|
    /// | `WAYPOST_DB_HOST`     | `localhost` |
    /// | `WAYPOST_DB_PORT`     | `5432`      |
    /// | `WAYPOST_DB_USER`     | required    |
    /// | `WAYPOST_DB_PASSWORD` | empty       |
    /// | `WAYPOST_DB_NAME`     | required    |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let port = match std::env::var("WAYPOST_DB_PORT") {
            Ok(value) => u16::from_str(&value).map_err(|_| ConfigError::Invalid {
                var: "WAYPOST_DB_PORT",
                value,
            })?,
            Err(_) => 5432,
        };

        Ok(Self {
            host: std::env::var("WAYPOST_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port,
            username: std::env::var("WAYPOST_DB_USER")
                .map_err(|_| ConfigError::Missing("WAYPOST_DB_USER"))?,
            password: std::env::var("WAYPOST_DB_PASSWORD").unwrap_or_default(),
            database: std::env::var("WAYPOST_DB_NAME")
                .map_err(|_| ConfigError::Missing("WAYPOST_DB_NAME"))?,
        })
    }

    /// Connection options for sqlx; credentials are passed verbatim, so no
    /// URL escaping is involved.
    #[cfg(feature = "postgres")]
    pub fn connect_options(&self) -> sqlx::postgres::PgConnectOptions {
        sqlx::postgres::PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(sqlx::postgres::PgSslMode::Disable)
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Configuration for the Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            max_lifetime: None,
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
        }
    }
}

/// Timing and identity settings shared by the workflow and activity workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when no work was found.
    pub poll_interval: Duration,
    /// How long a claim stays valid without a heartbeat.
    pub lease_duration: Duration,
    /// Which pending run is claimed first.
    pub claim_order: ClaimOrder,
    /// Fixed worker identity; a random one is generated when unset.
    pub worker_id: Option<String>,
    /// Base delay before retrying a run after a transient storage fault.
    pub retry_delay: Duration,
    /// Transient faults tolerated per run before it is marked `failed`.
    pub max_retries: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_duration: DEFAULT_LEASE_DURATION,
            claim_order: ClaimOrder::default(),
            worker_id: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Everything needed to build an [`Engine`](crate::Engine) on Postgres.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db: DbConfig,
    /// Create the tables if they do not exist yet.
    pub init_db: bool,
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
}

impl EngineConfig {
    pub fn new(db: DbConfig, init_db: bool) -> Self {
        Self {
            db,
            init_db,
            pool: PoolConfig::default(),
            worker: WorkerConfig::default(),
        }
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let db = DbConfig::new("localhost", 5432, "waypost", "hunter2", "waypost");
        let rendered = format!("{db:?}");

        assert!(rendered.contains("waypost"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new(
            DbConfig::new("localhost", 5432, "u", "p", "d"),
            true,
        );

        assert!(config.init_db);
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker.claim_order, ClaimOrder::OldestFirst);
        assert_eq!(config.worker.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(config.worker.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.pool.max_size, DEFAULT_POOL_SIZE);
    }
}
