//! Queue channels.
//!
//! A `QueueChannel` owns one exchange/queue/routing-key binding over one broker
//! sub-channel. It buffers outgoing messages in memory (see `buffer`), keeps a
//! list of consumer registrations (see `consumer`) and rebuilds both whenever
//! the supervisor hands it a fresh connection.
//!
//! All mutable state lives in a single `ChannelState` behind one mutex, so
//! readiness, the drain flag, the pause flag and the closing flag are always
//! read and changed together.

mod buffer;
mod consumer;

pub use consumer::{MessageHandler, MessageStatus};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerConnection, ExchangeKind};
use crate::config::QueueOptions;
use crate::error::{AmqpError, Result};

use buffer::BufferedMessage;
use consumer::ConsumerRegistration;

/// Readiness of a queue channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Never reloaded; waiting for the first connection.
    Uninitialized,
    /// Topology is being (re)declared, or the connection dropped.
    Reloading,
    /// Topology declared; publishing and consuming are live.
    Ready,
    /// Closed for good.
    Closed,
}

struct ChannelState {
    readiness: Readiness,
    channel: Option<Arc<dyn BrokerChannel>>,
    buffer: VecDeque<BufferedMessage>,
    draining: bool,
    paused: bool,
    closing: bool,
    generation: u64,
    /// Cancelled whenever the current consumer generation goes stale.
    generation_token: CancellationToken,
    registrations: Vec<Arc<ConsumerRegistration>>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            readiness: Readiness::Uninitialized,
            channel: None,
            buffer: VecDeque::new(),
            draining: false,
            paused: false,
            closing: false,
            generation: 0,
            generation_token: CancellationToken::new(),
            registrations: Vec::new(),
        }
    }

    fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }
}

/// One exchange/queue/routing-key binding with buffered publishing and
/// self-restarting consumers.
pub struct QueueChannel {
    name: String,
    exchange: String,
    kind: ExchangeKind,
    routing_key: String,
    options: QueueOptions,
    /// Serializes topology setup and consumer restarts.
    topology: Mutex<()>,
    state: Mutex<ChannelState>,
    active_workers: Arc<AtomicUsize>,
}

impl QueueChannel {
    /// Create an uninitialized queue channel bound through a direct exchange.
    pub fn new(
        name: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        options: QueueOptions,
    ) -> Self {
        Self {
            name: name.into(),
            exchange: exchange.into(),
            kind: ExchangeKind::Direct,
            routing_key: routing_key.into(),
            options,
            topology: Mutex::new(()),
            state: Mutex::new(ChannelState::new()),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub async fn readiness(&self) -> Readiness {
        self.state.lock().await.readiness
    }

    /// Messages waiting in the overflow buffer.
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    /// Whether a drain worker is currently running.
    pub async fn is_draining(&self) -> bool {
        self.state.lock().await.draining
    }

    /// Current consumer generation; bumped on every consumer restart.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Consumer worker tasks currently running, across all generations.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Rebuild the sub-channel and topology over `connection`.
    ///
    /// Closes the previous sub-channel, if any, then declares the exchange and
    /// queue and binds them. On success the channel becomes `Ready`, consumers
    /// restart under a new generation and the drain worker resumes if messages
    /// are buffered. On failure the channel stays
    /// `Reloading` until the next reload.
    pub async fn reload(self: &Arc<Self>, connection: &Arc<dyn BrokerConnection>) -> Result<()> {
        let _topology = self.topology.lock().await;
        self.reload_locked(connection).await
    }

    /// Reload unless the channel is already `Ready`.
    ///
    /// Disconnects drop every queue out of `Ready`, so a ready queue is always
    /// bound to the current connection.
    pub(crate) async fn ensure_ready(
        self: &Arc<Self>,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<()> {
        let _topology = self.topology.lock().await;
        if self.state.lock().await.is_ready() {
            debug!(queue = %self.name, "Queue already ready");
            return Ok(());
        }
        self.reload_locked(connection).await
    }

    async fn reload_locked(self: &Arc<Self>, connection: &Arc<dyn BrokerConnection>) -> Result<()> {
        let stale = {
            let mut state = self.state.lock().await;
            if state.readiness == Readiness::Closed {
                return Err(AmqpError::Closing(self.name.clone()));
            }
            state.readiness = Readiness::Reloading;
            state.generation_token.cancel();
            state.channel.take()
        };

        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                debug!(queue = %self.name, error = %e, "Closing previous sub-channel");
            }
        }

        debug!(queue = %self.name, "Queue reload started");

        let channel = connection.open_channel().await?;
        if let Err(e) = self.declare_topology(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                debug!(queue = %self.name, error = %close_err, "Closing failed sub-channel");
            }
            return Err(e);
        }

        {
            let mut state = self.state.lock().await;
            if state.readiness == Readiness::Closed {
                drop(state);
                let _ = channel.close().await;
                return Err(AmqpError::Closing(self.name.clone()));
            }
            state.channel = Some(channel);
            state.readiness = Readiness::Ready;
        }

        info!(
            queue = %self.name,
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            "Queue ready"
        );

        self.launch_consumers().await;
        self.trigger_drain().await;

        Ok(())
    }

    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> Result<()> {
        channel
            .exchange_declare(&self.exchange, self.kind)
            .await
            .map_err(|e| AmqpError::Topology(format!("exchange declare failed: {}", e)))?;

        channel
            .queue_declare(&self.name)
            .await
            .map_err(|e| AmqpError::Topology(format!("queue declare failed: {}", e)))?;

        channel
            .queue_bind(&self.name, &self.routing_key, &self.exchange)
            .await
            .map_err(|e| AmqpError::Topology(format!("queue bind failed: {}", e)))?;

        Ok(())
    }

    /// Drop back to `Reloading` after the connection went away.
    ///
    /// Stops the current consumer generation and forgets the dead sub-channel.
    /// Buffered messages stay put until the next reload.
    pub(crate) async fn mark_disconnected(&self) {
        let mut state = self.state.lock().await;
        if state.readiness == Readiness::Closed {
            return;
        }
        state.readiness = Readiness::Reloading;
        state.generation_token.cancel();
        state.channel = None;
        debug!(queue = %self.name, "Queue waiting for reconnect");
    }

    /// Gracefully close the queue channel.
    ///
    /// New publishes are refused immediately. Buffered messages are drained
    /// while the channel is ready; if it is not ready for
    /// `close_max_retries` consecutive checks the remaining messages are
    /// abandoned. The sub-channel is closed either way.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.readiness == Readiness::Closed {
                return Ok(());
            }
            state.closing = true;
            state.generation_token.cancel();
        }

        let mut retries = 0;
        loop {
            let (pending, draining, ready) = {
                let state = self.state.lock().await;
                (state.buffer.len(), state.draining, state.is_ready())
            };

            if pending == 0 && !draining {
                break;
            }

            if ready {
                self.trigger_drain().await;
            } else {
                retries += 1;
                if retries >= self.options.close_max_retries {
                    warn!(
                        queue = %self.name,
                        pending,
                        "Queue never became ready, abandoning buffered messages"
                    );
                    break;
                }
            }

            tokio::time::sleep(self.options.close_poll_interval).await;
        }

        let _topology = self.topology.lock().await;
        let channel = {
            let mut state = self.state.lock().await;
            state.readiness = Readiness::Closed;
            state.channel.take()
        };

        info!(queue = %self.name, "Queue closed");

        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
