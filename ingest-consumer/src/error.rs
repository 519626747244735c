use thiserror::Error;

/// Failures reported by a bus client.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to connect to bus: {0}")]
    Connect(String),
    #[error("failed to subscribe to topic {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("failed to disconnect from bus: {0}")]
    Disconnect(String),
    #[error("bus client is not connected")]
    NotConnected,
    #[error("bus client is already connected")]
    AlreadyConnected,
    #[error("bus client already has an active subscription")]
    AlreadySubscribed,
}

/// Terminal errors returned by `Consumer::start`.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("connection to the bus failed")]
    Connection(#[source] BusError),
    #[error("subscription to the bus failed")]
    Subscription(#[source] BusError),
    #[error("consumer was cancelled")]
    Cancelled,
    #[error("consumer has already been started")]
    AlreadyStarted,
}

impl ConsumerError {
    /// Cancellation is the expected way for a running consumer to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConsumerError::Cancelled)
    }
}

/// Failures while persisting a single event.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),
    #[error("sink write failed: {0}")]
    Write(String),
}
