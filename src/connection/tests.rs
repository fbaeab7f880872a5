use super::*;
use crate::broker::MockBroker;
use crate::queue::{MessageStatus, Readiness};
use crate::test_utils::fast_connection_options;

async fn connected(broker: &MockBroker, options: ConnectionOptions) -> Connection {
    let connection = Connection::with_broker(broker.clone(), options).unwrap();
    assert!(eventually!(
        connection.state() == ConnectionState::Connected
    ));
    connection
}

async fn current_connection(connection: &Connection) -> Arc<dyn BrokerConnection> {
    connection.inner.current.lock().await.clone().unwrap()
}

#[tokio::test]
async fn test_missing_driver() {
    let result = Connection::with_broker(MockBroker::new(), ConnectionOptions::new());
    assert!(matches!(result, Err(AmqpError::MissingDriver)));
}

#[tokio::test]
async fn test_connects_on_first_dial() {
    let broker = MockBroker::new();
    let connection = connected(&broker, fast_connection_options()).await;

    assert_eq!(broker.dial_count(), 1);
    assert_eq!(connection.reconnect_attempts(), 0);
    assert!(broker.has_live_connection().await);
}

#[tokio::test]
async fn test_retries_failed_dials_then_resets_counter() {
    let broker = MockBroker::new();
    broker.fail_next_dials(2);
    let options = fast_connection_options().with_max_reconnects(5);

    let connection = connected(&broker, options).await;

    assert_eq!(broker.dial_count(), 3);
    assert_eq!(connection.reconnect_attempts(), 0);
}

#[tokio::test]
async fn test_exhausted_reconnects_fail_connection() {
    let broker = MockBroker::new();
    broker.fail_next_dials(100);
    let options = fast_connection_options().with_max_reconnects(2);

    let connection = Connection::with_broker(broker.clone(), options).unwrap();
    let mut states = connection.watch_state();
    states
        .wait_for(|state| *state == ConnectionState::Failed)
        .await
        .unwrap();

    // first dial plus two retries
    assert_eq!(broker.dial_count(), 3);
    assert_eq!(connection.reconnect_attempts(), 3);
    assert!(matches!(
        connection.queue("orders", "orders-exchange", "created").await,
        Err(AmqpError::ReconnectExhausted(3))
    ));
    assert!(matches!(
        connection.close().await,
        Err(AmqpError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn test_unbounded_reconnects_keep_dialing() {
    let broker = MockBroker::new();
    broker.fail_next_dials(20);
    let options = fast_connection_options()
        .with_max_reconnects(0)
        .with_reconnect_delay(std::time::Duration::from_millis(1));

    let _connection = connected(&broker, options).await;

    assert_eq!(broker.dial_count(), 21);
}

#[tokio::test]
async fn test_queue_registered_before_connect_is_reloaded() {
    let broker = MockBroker::new();
    broker.fail_next_dials(1);

    let connection = Connection::with_broker(broker.clone(), fast_connection_options()).unwrap();
    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();

    assert!(eventually!(queue.readiness().await == Readiness::Ready));
    assert!(broker.is_bound("orders", "created", "orders-exchange").await);
    assert_eq!(connection.queues().await.len(), 1);
}

#[tokio::test]
async fn test_queue_created_while_connected_is_ready() {
    let broker = MockBroker::new();
    let connection = connected(&broker, fast_connection_options()).await;

    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();

    assert_eq!(queue.readiness().await, Readiness::Ready);
}

#[tokio::test]
async fn test_queue_created_while_connected_is_built_once() {
    let broker = MockBroker::new();
    let connection = connected(&broker, fast_connection_options()).await;

    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();
    let generation = queue.generation().await;
    connection.inner.reload_queues(&current_connection(&connection).await).await;

    assert_eq!(queue.generation().await, generation);
    assert_eq!(broker.opened_channels(), 1);
    assert_eq!(broker.closed_channels(), 0);
}

#[tokio::test]
async fn test_reconnect_rebuilds_queue_on_new_connection() {
    let broker = MockBroker::new();
    let connection = connected(&broker, fast_connection_options()).await;
    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();

    broker.drop_connection("connection reset").await;

    assert!(eventually!(
        broker.dial_count() == 2 && queue.readiness().await == Readiness::Ready
    ));
    assert_eq!(broker.opened_channels(), 2);
}

#[tokio::test]
async fn test_topology_failure_does_not_fail_queue_creation() {
    let broker = MockBroker::new();
    broker.refuse_topology(true);
    let connection = connected(&broker, fast_connection_options()).await;

    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();

    assert_eq!(queue.readiness().await, Readiness::Reloading);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_broker_drop_reconnects_and_restarts_consumers() {
    let broker = MockBroker::new();
    let connection = connected(&broker, fast_connection_options()).await;
    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();
    queue
        .consume(
            "audit",
            |_payload: Vec<u8>, _tag: String| async { MessageStatus::Succeed },
            2,
        )
        .await
        .unwrap();
    let before = queue.generation().await;

    broker.drop_connection("heartbeat timeout").await;

    assert!(eventually!(broker.dial_count() == 2));
    assert!(eventually!(
        connection.state() == ConnectionState::Connected
            && queue.readiness().await == Readiness::Ready
    ));
    assert!(queue.generation().await > before);
    assert!(eventually!(queue.active_workers() == 2));

    queue.publish("after-reconnect").await.unwrap();
    assert!(eventually!(broker.ack_count() == 1));
}

#[tokio::test]
async fn test_publish_during_outage_is_delivered_after_reconnect() {
    let broker = MockBroker::new();
    let options = fast_connection_options().with_max_reconnects(0);
    let connection = connected(&broker, options).await;
    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();

    broker.fail_next_dials(u32::MAX);
    broker.drop_connection("network partition").await;
    assert!(eventually!(connection.reconnect_attempts() >= 2));
    assert_eq!(queue.readiness().await, Readiness::Reloading);

    queue.publish("buffered-1").await.unwrap();
    queue.publish("buffered-2").await.unwrap();
    assert_eq!(queue.buffered().await, 2);

    broker.fail_next_dials(0);

    assert!(eventually!(broker.published_payloads().await.len() == 2));
    assert_eq!(
        broker.published_payloads().await,
        vec![b"buffered-1".to_vec(), b"buffered-2".to_vec()]
    );
    assert_eq!(connection.reconnect_attempts(), 0);
}

#[tokio::test]
async fn test_close_drains_then_closes_connection() {
    let broker = MockBroker::new();
    let connection = connected(&broker, fast_connection_options()).await;
    let queue = connection
        .queue("orders", "orders-exchange", "created")
        .await
        .unwrap();

    for i in 0..20 {
        queue.publish(format!("m{}", i)).await.unwrap();
    }

    connection.close().await.unwrap();

    assert_eq!(broker.published_payloads().await.len(), 20);
    assert_eq!(broker.closed_connections().await, 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(queue.readiness().await, Readiness::Closed);
}

#[tokio::test]
async fn test_close_twice_fails() {
    let broker = MockBroker::new();
    let connection = connected(&broker, fast_connection_options()).await;

    connection.close().await.unwrap();

    assert!(matches!(
        connection.close().await,
        Err(AmqpError::AlreadyClosed)
    ));
    assert!(matches!(
        connection.queue("late", "late-exchange", "rk").await,
        Err(AmqpError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn test_close_before_connected_fails() {
    let broker = MockBroker::new();
    broker.fail_next_dials(u32::MAX);
    let options = fast_connection_options().with_max_reconnects(0);

    let connection = Connection::with_broker(broker.clone(), options).unwrap();

    assert!(matches!(
        connection.close().await,
        Err(AmqpError::AlreadyClosed)
    ));
    assert_ne!(connection.state(), ConnectionState::Closed);
}

#[test]
fn test_state_display() {
    assert_eq!(ConnectionState::Connected.to_string(), "connected");
    assert_eq!(ConnectionState::Failed.to_string(), "failed");
    assert!(ConnectionState::Closing.is_final());
    assert!(!ConnectionState::Disconnected.is_final());
}
