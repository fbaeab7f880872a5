//! Broker client capability.
//!
//! This module contains:
//! - `Broker` / `BrokerConnection` / `BrokerChannel` traits: the operations the
//!   supervisor and queue channels need from a wire-level client
//! - `Delivery` and `Acknowledger`: a consumed message and its settlement handle
//! - Implementations: AMQP (lapin), Mock

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::LapinBroker;
pub use mock::MockBroker;

/// Stream of deliveries for one broker-level consumer. Ends when the
/// consumer is cancelled or its channel goes away.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Exchange routing strategy. Queue channels always bind by exact routing key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

/// Dials broker connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection to `url`.
    async fn dial(&self, url: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a sub-channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Resolves with the reason once the broker closes the connection.
    ///
    /// Each call returns an independent future. A connection closed through
    /// [`close`](BrokerConnection::close) is not reported.
    fn notify_close(&self) -> BoxFuture<'static, String>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

/// One broker sub-channel.
///
/// Exchanges and queues are declared non-durable and non-auto-delete; queues
/// are non-exclusive. Consumers use manual acknowledgement.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<()>;

    async fn queue_declare(&self, queue: &str) -> Result<()>;

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    /// Publish `payload`; returns once the broker has taken it.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Start a consumer identified by `consumer_tag`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Stop the consumer identified by `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message received from a broker consumer.
pub struct Delivery {
    /// Message body.
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(data: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self { data, acker }
    }

    /// Acknowledge this message only.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}
