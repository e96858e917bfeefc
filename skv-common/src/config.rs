//! # Pool and Connection Configuration
//!
//! One immutable struct drives both the pool (`Connectors`/`Cell`) and every
//! connection it opens. Loading it from files or the environment is left to
//! the caller; this module only provides defaults, builders and validation.

use std::time::Duration;

use crate::error::{SkvError, SkvResult};

/// Configuration for the pool and its connections.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host name or IP.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Credential sent with `auth` after connecting; `None` skips auth.
    pub password: Option<String>,
    /// Connections per cell.
    pub pool_size: usize,
    /// Lower bound on pooled connections; rounded down to whole cells.
    pub min_pool_size: usize,
    /// Upper bound on pooled connections; rounded down to whole cells.
    pub max_pool_size: usize,
    /// Maximum number of callers blocked waiting for a connection.
    pub max_wait_size: usize,
    /// Period between shrink evaluations (HealthSecond).
    pub health_interval: Duration,
    /// Period of the background health tick.
    pub health_tick: Duration,
    /// TCP dial timeout.
    pub connect_timeout: Duration,
    /// Per-response read timeout; zero disables it.
    pub read_timeout: Duration,
    /// Per-command write timeout; zero disables it.
    pub write_timeout: Duration,
    /// Socket receive buffer and read chunk size, in bytes.
    pub read_buffer_size: usize,
    /// Socket send buffer and command write buffer size, in bytes.
    pub write_buffer_size: usize,
    /// Reconnect and resubmit once when a command fails.
    pub retry_enabled: bool,
    /// Frame structured arguments through the pluggable encoder.
    pub encoding: bool,
    /// How long an acquisition may wait on a saturated pool.
    pub get_client_timeout: Duration,
    /// Release clients from `get_client` back to the pool after each command.
    pub auto_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8888,
            password: None,
            pool_size: 20,
            min_pool_size: 20,
            max_pool_size: 100,
            max_wait_size: 1000,
            health_interval: Duration::from_secs(5),
            health_tick: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            read_buffer_size: 8 * 1024,
            write_buffer_size: 8 * 1024,
            retry_enabled: false,
            encoding: false,
            get_client_timeout: Duration::from_secs(5),
            auto_close: false,
        }
    }
}

impl Config {
    /// Creates a default configuration pointed at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Config {
            host: host.into(),
            port,
            ..Config::default()
        }
    }

    /// Sets the auth credential.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets cell size and the min/max pooled connection bounds.
    pub fn with_pool(mut self, pool_size: usize, min_pool_size: usize, max_pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self.min_pool_size = min_pool_size;
        self.max_pool_size = max_pool_size;
        self
    }

    /// Sets the wait queue capacity.
    pub fn with_max_wait(mut self, max_wait_size: usize) -> Self {
        self.max_wait_size = max_wait_size;
        self
    }

    /// Sets the shrink evaluation interval and the tick period.
    pub fn with_health(mut self, interval: Duration, tick: Duration) -> Self {
        self.health_interval = interval;
        self.health_tick = tick;
        self
    }

    /// Sets connect, read and write timeouts.
    pub fn with_timeouts(mut self, connect: Duration, read: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Sets the acquisition timeout.
    pub fn with_get_client_timeout(mut self, timeout: Duration) -> Self {
        self.get_client_timeout = timeout;
        self
    }

    /// Enables or disables one transparent retry per command.
    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    /// Enables or disables the structured argument encoder.
    pub fn with_encoding(mut self, enabled: bool) -> Self {
        self.encoding = enabled;
        self
    }

    /// Enables or disables auto-close for clients from `get_client`.
    pub fn with_auto_close(mut self, enabled: bool) -> Self {
        self.auto_close = enabled;
        self
    }

    /// Returns `host:port` for dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Number of cell slots (`max_pool_size / pool_size`).
    pub fn cell_max(&self) -> usize {
        self.max_pool_size / self.pool_size.max(1)
    }

    /// Number of cells kept alive (`min_pool_size / pool_size`, at least one).
    pub fn cell_min(&self) -> usize {
        (self.min_pool_size / self.pool_size.max(1))
            .max(1)
            .min(self.cell_max().max(1))
    }

    /// Rejects configurations the pool cannot honor.
    pub fn validate(&self) -> SkvResult<()> {
        if self.host.is_empty() {
            return Err(SkvError::Config("host is empty".into()));
        }
        if self.port == 0 {
            return Err(SkvError::Config("port is zero".into()));
        }
        if self.pool_size == 0 {
            return Err(SkvError::Config("pool_size must be positive".into()));
        }
        if self.max_pool_size < self.pool_size {
            return Err(SkvError::Config(format!(
                "max_pool_size {} is smaller than pool_size {}",
                self.max_pool_size, self.pool_size
            )));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(SkvError::Config(format!(
                "min_pool_size {} exceeds max_pool_size {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.health_tick.is_zero() {
            return Err(SkvError::Config("health_tick must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_cell_bounds() {
        let config = Config::new("127.0.0.1", 8888).with_pool(5, 5, 20);
        assert_eq!(config.cell_min(), 1);
        assert_eq!(config.cell_max(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cell_min_is_at_least_one() {
        let config = Config::new("127.0.0.1", 8888).with_pool(10, 3, 30);
        assert_eq!(config.cell_min(), 1);
        assert_eq!(config.cell_max(), 3);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let config = Config::new("127.0.0.1", 8888).with_pool(5, 30, 20);
        assert!(matches!(config.validate(), Err(SkvError::Config(_))));

        let config = Config::new("127.0.0.1", 8888).with_pool(0, 0, 20);
        assert!(config.validate().is_err());

        let config = Config::new("127.0.0.1", 8888).with_pool(10, 5, 5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_host_and_zero_port() {
        assert!(Config::new("", 8888).validate().is_err());
        assert!(Config::new("localhost", 0).validate().is_err());
    }
}
