//! Event ingestion consumer.
//!
//! Reads events from a message bus, drops identities that were already seen
//! and writes each first-seen event once to ClickHouse.
//!
//! ```text
//! BusClient (Kafka) --delivery--> DeduplicatingProcessor --write--> Sink (ClickHouse)
//!        ^
//!        | connect / subscribe / disconnect
//!     Consumer::start(shutdown)
//! ```
//!
//! ## Error logging
//!
//! Log errors with `error = ?e` or `{e:#}` so the whole cause chain ends up in
//! the log line. `{}` / `%e` only shows the outermost message.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod metrics_consts;
pub mod processor;
pub mod server;
pub mod sink;
pub mod test_utils;

pub use bus::{BusClient, Delivery, DeliveryHandler};
pub use config::Config;
pub use consumer::{Consumer, ConsumerState};
pub use dedup::{RetentionPolicy, SeenSet};
pub use error::{BusError, ConsumerError, SinkError};
pub use processor::DeduplicatingProcessor;
pub use sink::Sink;
