use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusClient, Delivery, DeliveryHandler};
use crate::error::BusError;
use crate::metrics_consts::DELIVERIES_RECEIVED;

/// Where the deduplication identity of a Kafka message comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// The message key, falling back to the message coordinates when the key
    /// is missing or not valid UTF-8.
    ///
    /// Only correct when producers set a key unique to each event. Keys used
    /// for partitioning (a user or session id) are shared by many events, and
    /// every event after the first with that key is dropped as a duplicate.
    Key,
    /// `topic/partition/offset`, which a redelivery of the same record keeps.
    Offset,
}

impl FromStr for IdentitySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "key" => Ok(IdentitySource::Key),
            "offset" => Ok(IdentitySource::Offset),
            other => Err(format!("unknown identity source: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    pub hosts: String,
    pub consumer_group: String,
    pub topic: String,
    pub offset_reset: String,
    pub tls: bool,
    pub connect_timeout: Duration,
    pub identity_source: IdentitySource,
}

struct Dispatch {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Kafka implementation of [`BusClient`].
///
/// `connect` creates the consumer and fetches the topic metadata as the
/// handshake, `subscribe` starts a single dispatch task that awaits the
/// handler for every message, and `disconnect` stops that task before
/// unsubscribing.
pub struct KafkaBus {
    config: KafkaBusConfig,
    consumer: Option<Arc<StreamConsumer>>,
    dispatch: Option<Dispatch>,
}

impl KafkaBus {
    pub fn new(config: KafkaBusConfig) -> Self {
        Self {
            config,
            consumer: None,
            dispatch: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.consumer.is_some()
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.hosts)
            .set("group.id", &self.config.consumer_group)
            .set("auto.offset.reset", &self.config.offset_reset)
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", "10000")
            .set("statistics.interval.ms", "10000");

        if self.config.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

#[async_trait]
impl BusClient for KafkaBus {
    async fn connect(&mut self) -> Result<(), BusError> {
        if self.consumer.is_some() {
            return Err(BusError::AlreadyConnected);
        }

        let consumer: StreamConsumer = self
            .client_config()
            .create()
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let consumer = Arc::new(consumer);

        // librdkafka connects lazily, fetching metadata forces a broker round trip
        let probe = consumer.clone();
        let topic = self.config.topic.clone();
        let timeout = self.config.connect_timeout;
        tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| BusError::Connect(format!("metadata probe did not complete: {e}")))?
        .map_err(|e| BusError::Connect(e.to_string()))?;

        info!("Connected to Kafka at {}", self.config.hosts);
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn subscribe(&mut self, handler: DeliveryHandler) -> Result<(), BusError> {
        let consumer = self.consumer.clone().ok_or(BusError::NotConnected)?;
        if self.dispatch.is_some() {
            return Err(BusError::AlreadySubscribed);
        }

        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| BusError::Subscribe {
                topic: self.config.topic.clone(),
                reason: e.to_string(),
            })?;

        let stop = CancellationToken::new();
        let task = tokio::spawn(dispatch_loop(
            consumer,
            handler,
            self.config.identity_source,
            stop.clone(),
        ));

        info!(
            "Subscribed to topic '{}' with consumer group '{}'",
            self.config.topic, self.config.consumer_group
        );
        self.dispatch = Some(Dispatch { stop, task });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        let mut result = Ok(());

        if let Some(dispatch) = self.dispatch.take() {
            dispatch.stop.cancel();
            if let Err(e) = dispatch.task.await {
                error!("Kafka dispatch task failed: {e:#}");
                result = Err(BusError::Disconnect(e.to_string()));
            }
        }

        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            info!("Disconnected from Kafka at {}", self.config.hosts);
        }

        result
    }
}

async fn dispatch_loop(
    consumer: Arc<StreamConsumer>,
    handler: DeliveryHandler,
    identity_source: IdentitySource,
    stop: CancellationToken,
) {
    let mut stream = consumer.stream();

    loop {
        let delivery = {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => Some(delivery_from_message(&message, identity_source)),
                Some(Err(e)) => {
                    error!(error = ?e, "Kafka consumer error");
                    None
                }
                None => {
                    warn!("Kafka message stream ended");
                    break;
                }
            }
        };

        match delivery {
            Some(delivery) => {
                debug!("Dispatching delivery {}", delivery.identity);
                metrics::counter!(DELIVERIES_RECEIVED).increment(1);
                handler(delivery).await;
            }
            None => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }

    debug!("Kafka dispatch loop stopped");
}

pub(crate) fn delivery_from_message<M: Message>(
    message: &M,
    identity_source: IdentitySource,
) -> Delivery {
    let coordinates = || {
        format!(
            "{}/{}/{}",
            message.topic(),
            message.partition(),
            message.offset()
        )
    };

    let identity = match identity_source {
        IdentitySource::Key => message
            .key()
            .and_then(|key| std::str::from_utf8(key).ok())
            .map(str::to_owned)
            .unwrap_or_else(coordinates),
        IdentitySource::Offset => coordinates(),
    };

    let payload = message
        .payload()
        .map(Bytes::copy_from_slice)
        .unwrap_or_default();

    Delivery { identity, payload }
}
