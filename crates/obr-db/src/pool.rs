//! Connection pool for the annotation store.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use obr_core::{Error, Result};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Sizing and timeouts handed to `PgPoolOptions`.
///
/// A stage holds one connection per open batch transaction, so
/// `max_connections` bounds how many resources can commit at the same time.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Never above `max_connections`.
    pub min_connections: u32,
    /// Budget for acquiring a connection; expiry surfaces as `PoolTimedOut`,
    /// which the retry controller treats as transient.
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load pool sizing from the environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OBR_DB_MAX_CONNECTIONS` | `10` |
    /// | `OBR_DB_CONNECT_TIMEOUT_SECS` | `30` |
    ///
    /// Keep `OBR_DB_MAX_CONNECTIONS` at or above `OBR_MAX_CONCURRENT_RESOURCES`.
    pub fn from_env() -> Self {
        let max_connections = std::env::var("OBR_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let connect_timeout_secs = std::env::var("OBR_DB_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        Self::default()
            .max_connections(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self.min_connections = self.min_connections.min(n);
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n.min(self.max_connections);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connect_timeout_secs = config.connect_timeout.as_secs(),
        "Connecting annotation store"
    );

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(lifetime) = config.max_lifetime {
        options = options.max_lifetime(lifetime);
    }

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Annotation store connected"
    );
    Ok(pool)
}

/// Logged after a runner invocation. A pool with no idle connection left
/// means resources were queueing on acquire.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "database",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool usage"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = size,
            "No idle connections after run, raise OBR_DB_MAX_CONNECTIONS"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_connections_clamped_to_max() {
        let config = PoolConfig::new().min_connections(4).max_connections(2);
        assert_eq!(config.min_connections, 2);

        let config = PoolConfig::new().max_connections(3).min_connections(8);
        assert_eq!(config.min_connections, 3);
    }

    #[test]
    fn test_from_env_defaults() {
        std::env::remove_var("OBR_DB_MAX_CONNECTIONS");
        std::env::remove_var("OBR_DB_CONNECT_TIMEOUT_SECS");
        let config = PoolConfig::from_env();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(
            config.connect_timeout,
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
    }
}
