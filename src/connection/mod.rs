//! Connection supervisor.
//!
//! A `Connection` owns at most one live broker connection and a background
//! task that keeps it alive: dial, reload every registered queue channel, wait
//! for the broker to drop the connection, repeat. Dial failures are retried on
//! a fixed delay until the reconnect budget runs out, at which point the
//! connection parks in [`ConnectionState::Failed`] and reports it through
//! [`Connection::watch_state`].

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use backon::BackoffBuilder;
use futures::future::join_all;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "amqp")]
use crate::broker::LapinBroker;
use crate::broker::{Broker, BrokerConnection};
use crate::config::ConnectionOptions;
use crate::driver::Driver;
use crate::error::{AmqpError, Result};
use crate::queue::QueueChannel;
use crate::utils::retry::reconnect_backoff;

/// Lifecycle of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; a dial is pending.
    Disconnected,
    Connecting,
    Connected,
    /// `close` is shutting queue channels down.
    Closing,
    Closed,
    /// Reconnect budget exhausted. Terminal.
    Failed,
}

impl ConnectionState {
    /// Whether the supervisor has stopped for good or is about to.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supervised broker connection. Clones share the same supervisor.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    driver: Arc<dyn Driver>,
    broker: Arc<dyn Broker>,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
    queues: RwLock<Vec<Arc<QueueChannel>>>,
    shutdown: CancellationToken,
    /// Consecutive failed dials since the last successful one.
    attempts: AtomicU32,
}

impl Connection {
    /// Connect to RabbitMQ through lapin.
    ///
    /// Must be called from within a tokio runtime. Fails with `MissingDriver`
    /// when `options` carries no driver; dialing itself happens in the
    /// background.
    #[cfg(feature = "amqp")]
    pub fn new(options: ConnectionOptions) -> Result<Self> {
        Self::with_broker(LapinBroker::default(), options)
    }

    /// Supervise connections dialed through `broker`.
    pub fn with_broker(broker: impl Broker + 'static, options: ConnectionOptions) -> Result<Self> {
        let driver = options.driver.clone().ok_or(AmqpError::MissingDriver)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(Inner {
            driver,
            broker: Arc::new(broker),
            options,
            state,
            current: Mutex::new(None),
            queues: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            attempts: AtomicU32::new(0),
        });

        tokio::spawn(Arc::clone(&inner).supervise());

        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed dials; reset to 0 on every successful dial.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Registered queue channels, in registration order.
    pub async fn queues(&self) -> Vec<Arc<QueueChannel>> {
        self.inner.queues.read().await.clone()
    }

    /// Create and register a queue channel bound to `exchange` by `routing_key`.
    ///
    /// When connected the channel is reloaded right away; a topology failure
    /// is logged and the channel waits for the next reconnect. Otherwise it
    /// stays uninitialized until the supervisor connects.
    pub async fn queue(
        &self,
        name: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<Arc<QueueChannel>> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(AmqpError::AlreadyClosed)
            }
            ConnectionState::Failed => {
                return Err(AmqpError::ReconnectExhausted(self.reconnect_attempts()))
            }
            _ => {}
        }

        let queue = Arc::new(QueueChannel::new(
            name,
            exchange,
            routing_key,
            self.inner.options.queue.clone(),
        ));
        self.inner.queues.write().await.push(Arc::clone(&queue));

        // the supervisor publishes `Connected` before it snapshots the queue
        // list; whichever side gets here second finds the queue ready
        if self.state() == ConnectionState::Connected {
            let current = self.inner.current.lock().await.clone();
            if let Some(connection) = current {
                if let Err(e) = queue.ensure_ready(&connection).await {
                    warn!(queue = %queue.name(), error = %e, "Queue reload failed");
                }
            }
        }

        Ok(queue)
    }

    /// Close every queue channel, then the broker connection, then stop the
    /// supervisor.
    ///
    /// Fails with `AlreadyClosed` unless currently connected.
    pub async fn close(&self) -> Result<()> {
        let began = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(AmqpError::AlreadyClosed);
        }

        info!("Closing connection");

        let queues = self.queues().await;
        let results = join_all(queues.iter().map(|queue| queue.close())).await;
        for (queue, result) in queues.iter().zip(results) {
            if let Err(e) = result {
                warn!(queue = %queue.name(), error = %e, "Queue close failed");
            }
        }

        let connection = self.inner.current.lock().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Broker connection close failed");
            }
        }

        self.inner.shutdown.cancel();
        self.inner.state.send_replace(ConnectionState::Closed);

        info!("Connection closed");
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Move to `next` unless the connection is closing, closed or failed.
    /// Returns false when the supervisor should stop.
    fn advance(&self, next: ConnectionState) -> bool {
        let mut running = false;
        self.state.send_if_modified(|state| {
            if state.is_final() {
                return false;
            }
            running = true;
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        running
    }

    /// Reconnect loop. Runs until shutdown or until the reconnect budget is
    /// spent.
    async fn supervise(self: Arc<Self>) {
        let builder = reconnect_backoff(self.options.reconnect_delay, self.options.max_reconnects);
        let mut backoff = builder.build();

        loop {
            if self.shutdown.is_cancelled() || !self.advance(ConnectionState::Connecting) {
                break;
            }

            match self.broker.dial(&self.driver.url()).await {
                Ok(connection) => {
                    // Reset backoff on successful connection
                    backoff = builder.build();
                    self.attempts.store(0, Ordering::SeqCst);

                    let closed = connection.notify_close();
                    *self.current.lock().await = Some(Arc::clone(&connection));

                    if !self.advance(ConnectionState::Connected) {
                        self.current.lock().await.take();
                        if let Err(e) = connection.close().await {
                            debug!(error = %e, "Closing superseded connection failed");
                        }
                        break;
                    }

                    info!("Connected to broker");
                    self.reload_queues(&connection).await;

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        reason = closed => {
                            if self.state.borrow().is_final() {
                                break;
                            }
                            warn!(reason = %reason, "Broker closed connection, reconnecting");
                            self.on_disconnect().await;
                        }
                    }
                }
                Err(e) => {
                    let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

                    match backoff.next() {
                        Some(delay) => {
                            warn!(
                                attempts,
                                backoff_ms = %delay.as_millis(),
                                error = %e,
                                "Failed to connect, retrying after backoff"
                            );
                            self.advance(ConnectionState::Disconnected);

                            tokio::select! {
                                _ = self.shutdown.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            error!(
                                attempts,
                                error = %e,
                                "Reconnect attempts exhausted, giving up"
                            );
                            self.state.send_if_modified(|state| {
                                if state.is_final() {
                                    return false;
                                }
                                *state = ConnectionState::Failed;
                                true
                            });
                            break;
                        }
                    }
                }
            }
        }

        let state = *self.state.borrow();
        debug!(state = %state, "Supervisor stopped");
    }

    /// Reload every registered queue channel over `connection` concurrently.
    async fn reload_queues(&self, connection: &Arc<dyn BrokerConnection>) {
        let queues = self.queues.read().await.clone();
        if queues.is_empty() {
            return;
        }

        let results = join_all(queues.iter().map(|queue| queue.ensure_ready(connection))).await;

        let mut ready = 0usize;
        for (queue, result) in queues.iter().zip(results) {
            match result {
                Ok(()) => ready += 1,
                Err(e) => error!(queue = %queue.name(), error = %e, "Queue reload failed"),
            }
        }

        info!(ready, total = queues.len(), "Queues reloaded");
    }

    async fn on_disconnect(&self) {
        self.current.lock().await.take();
        self.advance(ConnectionState::Disconnected);

        let queues = self.queues.read().await.clone();
        for queue in &queues {
            queue.mark_disconnected().await;
        }
    }
}
