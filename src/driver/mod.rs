//! Connection URL drivers.
//!
//! A driver knows how to turn credentials into a broker URL. The supervisor
//! asks for a fresh URL on every dial, so drivers backed by rotating
//! credentials are picked up on reconnect.

mod static_driver;

pub use static_driver::{
    StaticDriver, StaticDriverConfig, DEFAULT_PORT, ENV_AMQP_HOST, ENV_AMQP_PASS, ENV_AMQP_PORT,
    ENV_AMQP_USER, ENV_AMQP_VHOST,
};

/// Produces the connection URL used to dial the broker.
pub trait Driver: Send + Sync {
    /// Fully qualified connection URL (scheme, credentials, host, port, vhost).
    fn url(&self) -> String;
}

/// Driver wrapping a pre-built URL.
#[derive(Clone, Debug)]
pub struct UrlDriver {
    url: String,
}

impl UrlDriver {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Driver for UrlDriver {
    fn url(&self) -> String {
        self.url.clone()
    }
}
