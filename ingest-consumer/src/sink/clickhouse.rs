use async_trait::async_trait;
use bytes::Bytes;
use clickhouse::{Client, Row};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use super::Sink;
use crate::error::SinkError;

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub table: String,
}

/// One ingested event. The payload is stored in a `String` column as raw bytes.
///
/// ```sql
/// CREATE TABLE ingested_events (
///     identity String,
///     payload String,
///     ingested_at DateTime64(3)
/// ) ENGINE = MergeTree ORDER BY (identity, ingested_at)
/// ```
#[derive(Row, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub identity: String,
    pub payload: Bytes,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub ingested_at: OffsetDateTime,
}

// Only the single-row insert is exposed so the sink can be tested without a server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RowInserter: Send + Sync {
    async fn insert(&self, row: EventRow) -> Result<(), SinkError>;
}

pub struct ClickHouseInserter {
    client: Client,
    table: String,
}

impl ClickHouseInserter {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl RowInserter for ClickHouseInserter {
    async fn insert(&self, row: EventRow) -> Result<(), SinkError> {
        let mut insert = self.client.insert::<EventRow>(&self.table)?;
        insert.write(&row).await?;
        insert.end().await?;
        Ok(())
    }
}

/// Writes each event to ClickHouse with a single-row insert.
pub struct ClickHouseSink<I = ClickHouseInserter> {
    inserter: I,
}

impl ClickHouseSink<ClickHouseInserter> {
    /// Build a client from `config` and check the server answers before
    /// handing the sink out.
    pub async fn connect(config: &ClickHouseConfig) -> Result<Self, SinkError> {
        let client = Client::default()
            .with_url(config.url.clone())
            .with_database(config.database.clone())
            .with_user(config.user.clone())
            .with_password(config.password.clone());

        client.query("SELECT 1").execute().await?;

        info!(
            "Successfully connected to ClickHouse at {}, writing to {}.{}",
            config.url, config.database, config.table
        );

        Ok(Self::with_inserter(ClickHouseInserter::new(
            client,
            config.table.clone(),
        )))
    }
}

impl<I: RowInserter> ClickHouseSink<I> {
    pub fn with_inserter(inserter: I) -> Self {
        Self { inserter }
    }
}

#[async_trait]
impl<I: RowInserter> Sink for ClickHouseSink<I> {
    async fn write(&self, identity: &str, payload: Bytes) -> Result<(), SinkError> {
        let row = EventRow {
            identity: identity.to_owned(),
            payload,
            ingested_at: OffsetDateTime::now_utc(),
        };

        self.inserter.insert(row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_inserts_one_row_with_unmodified_payload() {
        let mut inserter = MockRowInserter::new();
        inserter
            .expect_insert()
            .withf(|row| row.identity == "42" && row.payload == Bytes::from_static(b"hello"))
            .times(1)
            .returning(|_| Ok(()));

        let sink = ClickHouseSink::with_inserter(inserter);

        sink.write("42", Bytes::from_static(b"hello")).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_passes_binary_payload_through() {
        let payload = Bytes::from_static(&[0x00, 0xff, 0x10, 0x80]);
        let expected = payload.clone();

        let mut inserter = MockRowInserter::new();
        inserter
            .expect_insert()
            .withf(move |row| row.payload == expected)
            .times(1)
            .returning(|_| Ok(()));

        let sink = ClickHouseSink::with_inserter(inserter);

        sink.write("binary", payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_failure_is_returned() {
        let mut inserter = MockRowInserter::new();
        inserter
            .expect_insert()
            .times(1)
            .returning(|_| Err(SinkError::Write("table is read only".to_string())));

        let sink = ClickHouseSink::with_inserter(inserter);

        let err = sink
            .write("42", Bytes::from_static(b"hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Write(reason) if reason == "table is read only"));
    }
}
