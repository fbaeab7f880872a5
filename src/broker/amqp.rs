//! AMQP (RabbitMQ) broker implementation over lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind,
};
use crate::error::{AmqpError, Result};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ through lapin.
#[derive(Clone, Default)]
pub struct LapinBroker {
    properties: ConnectionProperties,
}

impl LapinBroker {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn dial(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        let connection = lapin::Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| AmqpError::Connection(format!("Failed to connect: {}", e)))?;

        let (closed_tx, closed_rx) = watch::channel(None);
        connection.on_error(move |e| {
            warn!(error = %e, "AMQP connection error");
            let _ = closed_tx.send(Some(e.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            connection,
            closed: closed_rx,
        }))
    }
}

struct LapinConnection {
    connection: lapin::Connection,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| AmqpError::Channel(format!("Failed to create channel: {}", e)))?;

        Ok(Arc::new(LapinChannel { channel }))
    }

    fn notify_close(&self) -> BoxFuture<'static, String> {
        let mut closed = self.closed.clone();
        Box::pin(async move {
            match closed.wait_for(Option::is_some).await {
                Ok(reason) => (*reason).clone().unwrap_or_default(),
                Err(_) => "connection dropped".to_string(),
            }
        })
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| AmqpError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct LapinChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| AmqpError::Topology(format!("Failed to declare exchange: {}", e)))
    }

    async fn queue_declare(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| AmqpError::Topology(format!("Failed to declare queue: {}", e)))
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| AmqpError::Topology(format!("Failed to bind queue: {}", e)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| AmqpError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| AmqpError::Publish(format!("Publish confirmation failed: {}", e)))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| AmqpError::Consume(format!("Failed to start consumer: {}", e)))?;

        let tag = consumer_tag.to_string();
        let stream = consumer
            .take_while(move |delivery| {
                if let Err(e) = delivery {
                    warn!(consumer_tag = %tag, error = %e, "Consumer delivery error, closing stream");
                }
                future::ready(delivery.is_ok())
            })
            .filter_map(|delivery| {
                future::ready(delivery.ok().map(|delivery| {
                    Delivery::new(
                        delivery.data,
                        Box::new(LapinAcker {
                            acker: delivery.acker,
                        }),
                    )
                }))
            });

        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| AmqpError::Consume(format!("Failed to cancel consumer: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        debug!(channel_id = self.channel.id(), "Closing AMQP channel");
        self.channel
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| AmqpError::Channel(format!("Failed to close channel: {}", e)))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| AmqpError::Consume(format!("Failed to ack message: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| AmqpError::Consume(format!("Failed to reject message: {}", e)))
    }
}
