//! Error taxonomy for connections and queue channels.

/// Result type for connection and queue operations.
pub type Result<T> = std::result::Result<T, AmqpError>;

/// Errors surfaced by the supervisor, queue channels and broker backends.
#[derive(Debug, thiserror::Error)]
pub enum AmqpError {
    #[error("Missing connection driver")]
    MissingDriver,

    #[error("Connection already closed")]
    AlreadyClosed,

    #[error("Queue '{queue}' publish overstock: {buffered} buffered, limit {limit}")]
    Overstock {
        queue: String,
        buffered: usize,
        limit: usize,
    },

    #[error("Queue '{0}' is closing")]
    Closing(String),

    #[error("Topology setup failed: {0}")]
    Topology(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Consumer '{0}' is already registered")]
    DuplicateConsumer(String),

    #[error("Reconnect attempts exhausted after {0} failed dials")]
    ReconnectExhausted(u32),

    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AmqpError {
    /// Whether the caller can retry the same operation later.
    ///
    /// Backpressure and transport faults clear on their own; everything else
    /// needs a different call or a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AmqpError::Overstock { .. }
                | AmqpError::Connection(_)
                | AmqpError::Channel(_)
                | AmqpError::Publish(_)
        )
    }
}
