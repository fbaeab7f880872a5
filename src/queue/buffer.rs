//! Overflow buffer and drain worker.
//!
//! Publishing never talks to the broker directly. Messages are appended to an
//! in-memory FIFO and a single drain worker per queue channel moves them onto
//! the broker sub-channel whenever the channel is ready.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::QueueChannel;
use crate::error::{AmqpError, Result};

/// A payload waiting in the overflow buffer.
pub(super) struct BufferedMessage {
    payload: Vec<u8>,
    /// Failed hand-offs so far.
    attempts: u32,
}

impl BufferedMessage {
    fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            attempts: 0,
        }
    }
}

impl QueueChannel {
    /// Buffer `payload` for delivery.
    ///
    /// Fails with `Closing` once close has started and with `Overstock` when
    /// `max_overstock` messages are already waiting. Starts the drain worker
    /// if the channel is ready and none is running.
    pub async fn publish(self: &Arc<Self>, payload: impl Into<Vec<u8>>) -> Result<()> {
        let buffered = {
            let mut state = self.state.lock().await;
            if state.closing {
                return Err(AmqpError::Closing(self.name.clone()));
            }

            let limit = self.options.max_overstock;
            if limit > 0 && state.buffer.len() >= limit {
                return Err(AmqpError::Overstock {
                    queue: self.name.clone(),
                    buffered: state.buffer.len(),
                    limit,
                });
            }

            state.buffer.push_back(BufferedMessage::new(payload.into()));
            state.buffer.len()
        };

        trace!(queue = %self.name, buffered, "Message buffered");

        self.trigger_drain().await;
        Ok(())
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(self: &Arc<Self>, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.publish(body).await
    }

    /// Start the drain worker unless one is running, the channel is not
    /// ready, or there is nothing to drain.
    pub(super) async fn trigger_drain(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.draining || !state.is_ready() || state.buffer.is_empty() {
                return;
            }
            state.draining = true;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.drain().await });
    }

    /// Drain loop. Exactly one runs per queue channel; `draining` is set by
    /// `trigger_drain` and cleared here under the same lock as the exit check.
    async fn drain(&self) {
        debug!(queue = %self.name, "Drain worker started");

        loop {
            // only drain what was buffered when the pass began
            let pass = {
                let mut state = self.state.lock().await;
                if state.buffer.is_empty() || !state.is_ready() {
                    state.draining = false;
                    debug!(
                        queue = %self.name,
                        remaining = state.buffer.len(),
                        "Drain worker stopped"
                    );
                    return;
                }
                state.buffer.len()
            };

            let mut delivered = 0usize;
            for _ in 0..pass {
                let (message, channel) = {
                    let mut state = self.state.lock().await;
                    if !state.is_ready() {
                        break;
                    }
                    let Some(channel) = state.channel.clone() else {
                        break;
                    };
                    match state.buffer.pop_front() {
                        Some(message) => (message, channel),
                        None => break,
                    }
                };

                match channel
                    .publish(&self.exchange, &self.routing_key, &message.payload)
                    .await
                {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        if self.requeue_failed(message, &e).await {
                            break;
                        }
                    }
                }
            }

            let remaining = {
                let mut state = self.state.lock().await;
                if state.buffer.is_empty() {
                    state.draining = false;
                }
                state.buffer.len()
            };

            debug!(queue = %self.name, delivered, remaining, "Drain pass finished");

            if remaining == 0 {
                return;
            }

            tokio::time::sleep(self.options.drain_interval).await;
        }
    }

    /// Handle a failed hand-off. Returns true if the message went back to the
    /// head of the buffer (ending the pass), false if it was dropped.
    async fn requeue_failed(&self, mut message: BufferedMessage, cause: &AmqpError) -> bool {
        message.attempts += 1;

        if message.attempts < self.options.max_send_retries {
            warn!(
                queue = %self.name,
                attempts = message.attempts,
                error = %cause,
                "Publish failed, message returned to buffer"
            );
            self.state.lock().await.buffer.push_front(message);
            true
        } else {
            error!(
                queue = %self.name,
                attempts = message.attempts,
                bytes = message.payload.len(),
                error = %cause,
                "Publish failed, dropping message"
            );
            false
        }
    }
}
