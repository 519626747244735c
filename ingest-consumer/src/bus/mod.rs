pub mod kafka;

pub use kafka::{IdentitySource, KafkaBus, KafkaBusConfig};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::BusError;

/// One inbound message, reduced to what the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Deduplication key. Must be stable across redeliveries of the same message.
    pub identity: String,
    pub payload: Bytes,
}

impl Delivery {
    pub fn new(identity: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            identity: identity.into(),
            payload: payload.into(),
        }
    }
}

/// Callback registered with the bus at subscribe time. The transport awaits
/// the returned future once per delivery, possibly from several tasks at once.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// A publish/subscribe transport holding at most one connection and one
/// subscription.
#[async_trait]
pub trait BusClient: Send {
    async fn connect(&mut self) -> Result<(), BusError>;

    /// Register `handler` for the configured topic. No delivery reaches the
    /// handler before this returns `Ok`.
    async fn subscribe(&mut self, handler: DeliveryHandler) -> Result<(), BusError>;

    /// Drop the subscription and the connection. Once this returns, the
    /// handler is not invoked again. Calling it on a disconnected client is a
    /// no-op.
    async fn disconnect(&mut self) -> Result<(), BusError>;
}
