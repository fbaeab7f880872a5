//! Connection and queue configuration.
//!
//! `ConnectionOptions` is the programmatic surface handed to
//! [`Connection::new`](crate::Connection::new). `Settings` is the serde view of
//! the same knobs, loadable from YAML files and environment variables.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::driver::{Driver, StaticDriver, StaticDriverConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "amqp.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "AMQP_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "AMQP";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "AMQP_LOG";

pub const DEFAULT_MAX_SEND_RETRIES: u32 = 3;
pub const DEFAULT_MAX_RECONNECTS: u32 = 10;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CLOSE_MAX_RETRIES: u32 = 3;

/// Per-queue buffering and shutdown policy.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Buffered messages allowed before publish is refused. 0 = unbounded.
    pub max_overstock: usize,
    /// Failed broker publishes tolerated per message before it is dropped.
    pub max_send_retries: u32,
    /// Pause between drain passes while messages remain buffered.
    pub drain_interval: Duration,
    /// Pause between buffer checks during graceful close.
    pub close_poll_interval: Duration,
    /// Checks made against a non-ready channel before close gives up draining.
    pub close_max_retries: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_overstock: 0,
            max_send_retries: DEFAULT_MAX_SEND_RETRIES,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            close_poll_interval: DEFAULT_CLOSE_POLL_INTERVAL,
            close_max_retries: DEFAULT_CLOSE_MAX_RETRIES,
        }
    }
}

/// Options for constructing a [`Connection`](crate::Connection).
#[derive(Clone)]
pub struct ConnectionOptions {
    pub(crate) driver: Option<Arc<dyn Driver>>,
    /// Dial failures tolerated in a row before the connection fails. 0 = unbounded.
    pub max_reconnects: u32,
    /// Delay between dial attempts.
    pub reconnect_delay: Duration,
    /// Policy applied to every queue channel created by the connection.
    pub queue: QueueOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            driver: None,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            queue: QueueOptions::default(),
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("driver", &self.driver.is_some())
            .field("max_reconnects", &self.max_reconnects)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("queue", &self.queue)
            .finish()
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(mut self, driver: impl Driver + 'static) -> Self {
        self.driver = Some(Arc::new(driver));
        self
    }

    pub fn with_shared_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_max_send_retries(mut self, max_send_retries: u32) -> Self {
        self.queue.max_send_retries = max_send_retries;
        self
    }

    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn with_max_overstock(mut self, max_overstock: usize) -> Self {
        self.queue.max_overstock = max_overstock;
        self
    }

    pub fn with_drain_interval(mut self, drain_interval: Duration) -> Self {
        self.queue.drain_interval = drain_interval;
        self
    }

    pub fn with_close_poll_interval(mut self, close_poll_interval: Duration) -> Self {
        self.queue.close_poll_interval = close_poll_interval;
        self
    }
}

/// Serializable configuration, mirrors [`ConnectionOptions`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Broker coordinates for the static driver.
    pub broker: StaticDriverConfig,
    pub max_send_retries: u32,
    pub max_reconnects: u32,
    pub reconnect_delay_ms: u64,
    pub max_overstock: usize,
    pub drain_interval_ms: u64,
    pub close_poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: StaticDriverConfig::default(),
            max_send_retries: DEFAULT_MAX_SEND_RETRIES,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            max_overstock: 0,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL.as_millis() as u64,
            close_poll_interval_ms: DEFAULT_CLOSE_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Load settings from files and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `amqp.yaml` in the current directory (if it exists)
    /// 2. File given by `path` (required if provided)
    /// 3. File named by `AMQP_CONFIG` (required if set)
    /// 4. `AMQP__`-prefixed environment variables, `__` separating nested keys
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Convert into connection options backed by a [`StaticDriver`].
    pub fn into_options(self) -> ConnectionOptions {
        ConnectionOptions::new()
            .with_driver(StaticDriver::new(self.broker))
            .with_max_send_retries(self.max_send_retries)
            .with_max_reconnects(self.max_reconnects)
            .with_reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
            .with_max_overstock(self.max_overstock)
            .with_drain_interval(Duration::from_millis(self.drain_interval_ms))
            .with_close_poll_interval(Duration::from_millis(self.close_poll_interval_ms))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}
