//! In-memory broker for testing.
//!
//! Routes direct-exchange publishes to bound queues and hands queued messages
//! to consumers round-robin. Faults (dial refusals, topology refusals, publish
//! failures, dropped connections) are injected through `MockBroker` methods.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};

use super::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind,
};
use crate::error::{AmqpError, Result};

/// A message the mock broker accepted from a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Mock broker for testing. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    dials: AtomicU32,
    failing_dials: AtomicU32,
    refuse_topology: AtomicBool,
    failing_publishes: AtomicU32,
    publishes_in_flight: AtomicUsize,
    max_publishes_in_flight: AtomicUsize,
    acks: AtomicUsize,
    rejects: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MockQueue>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    live: Option<Arc<MockConnection>>,
    closed_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct MockQueue {
    pending: VecDeque<Vec<u8>>,
    consumers: Vec<(String, mpsc::UnboundedSender<Delivery>)>,
    cursor: usize,
}

/// Decrement `counter` if positive; true when it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` dials.
    pub fn fail_next_dials(&self, count: u32) {
        self.state.failing_dials.store(count, Ordering::SeqCst);
    }

    /// Refuse every exchange declaration while set.
    pub fn refuse_topology(&self, refuse: bool) {
        self.state.refuse_topology.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Total dial attempts, successful or not.
    pub fn dial_count(&self) -> u32 {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Highest number of publishes observed running at the same time.
    pub fn max_concurrent_publishes(&self) -> usize {
        self.state.max_publishes_in_flight.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> usize {
        self.state.acks.load(Ordering::SeqCst)
    }

    pub fn reject_count(&self) -> usize {
        self.state.rejects.load(Ordering::SeqCst)
    }

    /// Sub-channels opened over any connection.
    pub fn opened_channels(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    /// Sub-channels closed explicitly.
    pub fn closed_channels(&self) -> usize {
        self.state.channels_closed.load(Ordering::SeqCst)
    }

    /// Payloads accepted so far, in publish order.
    pub async fn published_payloads(&self) -> Vec<Vec<u8>> {
        let registry = self.state.registry.lock().await;
        registry
            .published
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.registry.lock().await.published.clone()
    }

    pub async fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state
            .registry
            .lock()
            .await
            .exchanges
            .get(exchange)
            .copied()
    }

    pub async fn is_bound(&self, queue: &str, routing_key: &str, exchange: &str) -> bool {
        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        self.state.registry.lock().await.bindings.contains(&binding)
    }

    /// Consumers currently attached to `queue`.
    pub async fn consumer_count(&self, queue: &str) -> usize {
        let mut registry = self.state.registry.lock().await;
        registry
            .queues
            .get_mut(queue)
            .map(|q| {
                q.consumers.retain(|(_, tx)| !tx.is_closed());
                q.consumers.len()
            })
            .unwrap_or(0)
    }

    /// Messages waiting in `queue` for a consumer.
    pub async fn pending_count(&self, queue: &str) -> usize {
        let registry = self.state.registry.lock().await;
        registry
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    pub async fn closed_connections(&self) -> usize {
        self.state.registry.lock().await.closed_connections
    }

    pub async fn has_live_connection(&self) -> bool {
        self.state.registry.lock().await.live.is_some()
    }

    /// Drop the live connection as if the broker went away.
    ///
    /// Consumer streams end, channels start failing and the connection's
    /// close notification fires with `reason`.
    pub async fn drop_connection(&self, reason: &str) {
        let mut registry = self.state.registry.lock().await;
        if let Some(connection) = registry.live.take() {
            connection.alive.store(false, Ordering::SeqCst);
            for queue in registry.queues.values_mut() {
                queue.consumers.clear();
            }
            connection.closed.send_replace(Some(reason.to_string()));
        }
    }
}

impl MockState {
    fn route(self: &Arc<Self>, registry: &mut Registry, queue_name: &str, payload: Vec<u8>) {
        let queue = registry.queues.entry(queue_name.to_string()).or_default();
        let mut payload = payload;

        while !queue.consumers.is_empty() {
            let index = queue.cursor % queue.consumers.len();
            let delivery = Delivery::new(
                payload.clone(),
                Box::new(MockAcker {
                    state: Arc::clone(self),
                    queue: queue_name.to_string(),
                    payload,
                }),
            );
            match queue.consumers[index].1.unbounded_send(delivery) {
                Ok(()) => {
                    queue.cursor = queue.cursor.wrapping_add(1);
                    return;
                }
                Err(e) => {
                    // consumer went away, try the next one
                    payload = e.into_inner().data;
                    queue.consumers.remove(index);
                }
            }
        }

        queue.pending.push_back(payload);
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.failing_dials) {
            return Err(AmqpError::Connection("mock dial refused".to_string()));
        }

        let (closed, _) = watch::channel(None);
        let connection = Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            alive: Arc::new(AtomicBool::new(true)),
            closed,
        });

        self.state.registry.lock().await.live = Some(Arc::clone(&connection));
        Ok(connection)
    }
}

struct MockConnection {
    state: Arc<MockState>,
    alive: Arc<AtomicBool>,
    closed: watch::Sender<Option<String>>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(AmqpError::Channel("connection is closed".to_string()));
        }

        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            connection_alive: Arc::clone(&self.alive),
            open: AtomicBool::new(true),
        }))
    }

    fn notify_close(&self) -> BoxFuture<'static, String> {
        let mut closed = self.closed.subscribe();
        Box::pin(async move {
            match closed.wait_for(Option::is_some).await {
                Ok(reason) => (*reason).clone().unwrap_or_default(),
                Err(_) => "connection dropped".to_string(),
            }
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Err(AmqpError::Connection("connection is closed".to_string()));
        }

        let mut registry = self.state.registry.lock().await;
        for queue in registry.queues.values_mut() {
            queue.consumers.clear();
        }
        registry.live = None;
        registry.closed_connections += 1;
        Ok(())
    }
}

struct MockChannel {
    state: Arc<MockState>,
    connection_alive: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) && self.connection_alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;
        if self.state.refuse_topology.load(Ordering::SeqCst) {
            return Err(AmqpError::Topology(format!(
                "exchange '{}' declaration refused",
                exchange
            )));
        }

        let mut registry = self.state.registry.lock().await;
        registry.exchanges.insert(exchange.to_string(), kind);
        Ok(())
    }

    async fn queue_declare(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut registry = self.state.registry.lock().await;
        registry.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let mut registry = self.state.registry.lock().await;
        if !registry.exchanges.contains_key(exchange) {
            return Err(AmqpError::Topology(format!(
                "no exchange '{}' to bind to",
                exchange
            )));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !registry.bindings.contains(&binding) {
            registry.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;

        let in_flight = self.state.publishes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_publishes_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        // let concurrent publishers interleave if there are any
        tokio::task::yield_now().await;

        let result = if take_one(&self.state.failing_publishes) {
            Err(AmqpError::Publish("mock publish refused".to_string()))
        } else {
            let mut registry = self.state.registry.lock().await;
            registry.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });

            let targets: Vec<String> = registry
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect();
            for queue in targets {
                self.state.route(&mut registry, &queue, payload.to_vec());
            }
            Ok(())
        };

        self.state.publishes_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded();
        let mut registry = self.state.registry.lock().await;
        let backlog: Vec<Vec<u8>> = {
            let entry = registry.queues.entry(queue.to_string()).or_default();
            entry.consumers.push((consumer_tag.to_string(), tx));
            entry.pending.drain(..).collect()
        };
        for payload in backlog {
            self.state.route(&mut registry, queue, payload);
        }

        Ok(Box::pin(rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut registry = self.state.registry.lock().await;
        for queue in registry.queues.values_mut() {
            queue.consumers.retain(|(tag, _)| tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(AmqpError::Channel("channel already closed".to_string()));
        }
        self.state.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockAcker {
    state: Arc<MockState>,
    queue: String,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.state.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.state.rejects.fetch_add(1, Ordering::SeqCst);
        if requeue {
            let mut registry = self.state.registry.lock().await;
            self.state
                .route(&mut registry, &self.queue, self.payload.clone());
        }
        Ok(())
    }
}
