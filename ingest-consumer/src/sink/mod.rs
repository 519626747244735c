mod clickhouse;

pub use self::clickhouse::{
    ClickHouseConfig, ClickHouseInserter, ClickHouseSink, EventRow, RowInserter,
};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SinkError;

/// Durable storage for deduplicated events.
///
/// The processor calls `write` at most once per identity and never retries a
/// failed write, so implementations should not rely on redelivery.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, identity: &str, payload: Bytes) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Arc<S> {
    async fn write(&self, identity: &str, payload: Bytes) -> Result<(), SinkError> {
        (**self).write(identity, payload).await
    }
}
