//! Consumer registration and restart.
//!
//! Registrations are kept for the lifetime of the queue channel. Every restart
//! opens `workers` broker consumers per registration under a new generation and
//! cancels the previous generation's token; stale workers notice at their next
//! message boundary (or immediately if idle) and exit on their own.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::QueueChannel;
use crate::broker::{BrokerChannel, Delivery, DeliveryStream};
use crate::error::{AmqpError, Result};

const PREFETCH_RETURN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of processing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Processed; the message is acknowledged.
    Succeed,
    /// Processing failed; the message is still acknowledged so it is not
    /// redelivered.
    Error,
    /// Reject and ask the broker to redeliver.
    Requeue,
}

/// Processes messages for a consumer registration.
///
/// Closures `Fn(Vec<u8>, String) -> impl Future<Output = MessageStatus>`
/// implement this trait.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one payload. `consumer_tag` names the worker that received it.
    fn handle(&self, payload: Vec<u8>, consumer_tag: String) -> BoxFuture<'static, MessageStatus>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Vec<u8>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MessageStatus> + Send + 'static,
{
    fn handle(&self, payload: Vec<u8>, consumer_tag: String) -> BoxFuture<'static, MessageStatus> {
        Box::pin((self)(payload, consumer_tag))
    }
}

/// A named consumer group.
pub(super) struct ConsumerRegistration {
    name: String,
    workers: usize,
    handler: Box<dyn MessageHandler>,
}

/// Broker consumer tag for one worker. Unique per generation so a restart on
/// the same sub-channel never reuses a tag the previous generation still holds.
fn consumer_tag(name: &str, registration: usize, worker: usize, generation: u64) -> String {
    format!("{}_{}-{}.g{}", name, registration, worker, generation)
}

/// Keeps `active_workers` in step with running worker tasks, including ones
/// that unwind.
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueueChannel {
    /// Register a consumer group with `workers` parallel workers (at least one)
    /// and restart consumption for every registration.
    pub async fn consume<H: MessageHandler>(
        self: &Arc<Self>,
        name: impl Into<String>,
        handler: H,
        workers: usize,
    ) -> Result<()> {
        let name = name.into();
        {
            let mut state = self.state.lock().await;
            if state.closing {
                return Err(AmqpError::Closing(self.name.clone()));
            }
            if state.registrations.iter().any(|r| r.name == name) {
                return Err(AmqpError::DuplicateConsumer(name));
            }
            state.registrations.push(Arc::new(ConsumerRegistration {
                name: name.clone(),
                workers: workers.max(1),
                handler: Box::new(handler),
            }));
        }

        debug!(queue = %self.name, consumer = %name, workers = workers.max(1), "Consumer registered");

        self.restart_consumers().await;
        Ok(())
    }

    /// Pause consumption. Running workers exit at their next message boundary.
    pub async fn stop_consume(&self) {
        let mut state = self.state.lock().await;
        state.paused = true;
        state.generation_token.cancel();
        info!(queue = %self.name, "Consumption paused");
    }

    /// Resume consumption after [`stop_consume`](Self::stop_consume).
    pub async fn start_consume(self: &Arc<Self>) {
        self.state.lock().await.paused = false;
        info!(queue = %self.name, "Consumption resumed");
        self.restart_consumers().await;
    }

    /// Restart every registration under a new generation.
    pub(super) async fn restart_consumers(self: &Arc<Self>) {
        let _topology = self.topology.lock().await;
        self.launch_consumers().await;
    }

    /// Restart routine proper; callers hold the topology lock.
    ///
    /// No-op unless the channel is ready, not paused and not closing.
    pub(super) async fn launch_consumers(self: &Arc<Self>) {
        let (channel, registrations, generation, token) = {
            let mut state = self.state.lock().await;
            if !state.is_ready() || state.paused || state.closing {
                return;
            }
            let Some(channel) = state.channel.clone() else {
                return;
            };

            state.generation_token.cancel();
            state.generation_token = CancellationToken::new();
            state.generation += 1;

            (
                channel,
                state.registrations.clone(),
                state.generation,
                state.generation_token.clone(),
            )
        };

        if registrations.is_empty() {
            return;
        }

        let mut started = 0usize;
        for (index, registration) in registrations.iter().enumerate() {
            for worker in 0..registration.workers {
                let tag = consumer_tag(&registration.name, index, worker, generation);
                match channel.consume(&self.name, &tag).await {
                    Ok(stream) => {
                        let guard = WorkerGuard::new(&self.active_workers);
                        tokio::spawn(run_worker(
                            Arc::clone(registration),
                            Arc::clone(&channel),
                            stream,
                            tag,
                            generation,
                            token.clone(),
                            guard,
                        ));
                        started += 1;
                    }
                    Err(e) => {
                        error!(
                            queue = %self.name,
                            consumer_tag = %tag,
                            error = %e,
                            "Failed to register consumer"
                        );
                    }
                }
            }
        }

        info!(queue = %self.name, generation, workers = started, "Consumers started");
    }
}

async fn run_worker(
    registration: Arc<ConsumerRegistration>,
    channel: Arc<dyn BrokerChannel>,
    mut stream: DeliveryStream,
    tag: String,
    generation: u64,
    token: CancellationToken,
    _guard: WorkerGuard,
) {
    debug!(consumer_tag = %tag, generation, "Consumer worker started");

    loop {
        let mut delivery = tokio::select! {
            biased;
            _ = token.cancelled() => {
                if let Err(e) = channel.cancel(&tag).await {
                    debug!(consumer_tag = %tag, error = %e, "Consumer cancel failed");
                }
                let returned = return_prefetched(&mut stream, &tag).await;
                debug!(consumer_tag = %tag, generation, returned, "Consumer worker superseded");
                break;
            }
            next = stream.next() => match next {
                Some(delivery) => delivery,
                None => {
                    debug!(consumer_tag = %tag, generation, "Consumer stream closed");
                    break;
                }
            },
        };

        let payload = std::mem::take(&mut delivery.data);
        let status = registration.handler.handle(payload, tag.clone()).await;
        settle(&delivery, status, &tag).await;
    }
}

/// Hand deliveries that arrived after the cancel back to the broker.
///
/// The broker ends the stream once the cancel is processed; the wait is
/// bounded in case a dead channel never does.
async fn return_prefetched(stream: &mut DeliveryStream, tag: &str) -> usize {
    let mut returned = 0usize;
    let drained = tokio::time::timeout(PREFETCH_RETURN_TIMEOUT, async {
        while let Some(delivery) = stream.next().await {
            if let Err(e) = delivery.reject(true).await {
                warn!(consumer_tag = %tag, error = %e, "Failed to return prefetched message");
            }
            returned += 1;
        }
    })
    .await;

    if drained.is_err() {
        warn!(consumer_tag = %tag, returned, "Consumer stream did not end after cancel");
    }
    returned
}

async fn settle(delivery: &Delivery, status: MessageStatus, tag: &str) {
    let result = match status {
        MessageStatus::Succeed | MessageStatus::Error => delivery.ack().await,
        MessageStatus::Requeue => delivery.reject(true).await,
    };

    if let Err(e) = result {
        warn!(consumer_tag = %tag, status = ?status, error = %e, "Failed to settle message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_tag_format() {
        assert_eq!(consumer_tag("orders", 0, 2, 1), "orders_0-2.g1");
        assert_eq!(consumer_tag("audit", 3, 0, 12), "audit_3-0.g12");
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |payload: Vec<u8>, tag: String| async move {
            if payload.is_empty() || tag.is_empty() {
                MessageStatus::Error
            } else {
                MessageStatus::Succeed
            }
        };

        assert_eq!(
            handler.handle(b"x".to_vec(), "t_0-0".to_string()).await,
            MessageStatus::Succeed
        );
        assert_eq!(
            handler.handle(Vec::new(), "t_0-0".to_string()).await,
            MessageStatus::Error
        );
    }

    #[test]
    fn test_worker_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = WorkerGuard::new(&counter);
        let second = WorkerGuard::new(&counter);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(first);
        drop(second);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
