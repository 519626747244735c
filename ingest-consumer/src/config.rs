use std::num::NonZeroUsize;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

use crate::bus::{IdentitySource, KafkaBusConfig};
use crate::dedup::RetentionPolicy;
use crate::sink::ClickHouseConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "ingest-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "ingest")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "10000")]
    pub kafka_connect_timeout_ms: u64,

    #[envconfig(default = "offset")]
    pub identity_source: IdentitySource, // offset, key

    // ClickHouse configuration
    #[envconfig(default = "http://localhost:8123")]
    pub clickhouse_url: String,

    #[envconfig(default = "default")]
    pub clickhouse_database: String,

    #[envconfig(default = "default")]
    pub clickhouse_user: String,

    #[envconfig(default = "")]
    pub clickhouse_password: String,

    #[envconfig(default = "ingested_events")]
    pub clickhouse_table: String,

    // Seen-set retention, unset (or 0) means unbounded
    pub dedup_max_identities: Option<usize>,

    pub dedup_retention_secs: Option<u64>,

    #[envconfig(default = "5")]
    pub shutdown_timeout_secs: u64,

    // Tracing
    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "ingest-consumer")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub otel_log_level: Level,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        let mut policy = RetentionPolicy::unbounded();
        if let Some(max_identities) = self.dedup_max_identities.and_then(NonZeroUsize::new) {
            policy = policy.with_max_identities(max_identities);
        }
        if let Some(secs) = self.dedup_retention_secs.filter(|secs| *secs > 0) {
            policy = policy.with_max_age(Duration::from_secs(secs));
        }
        policy
    }

    pub fn kafka_bus_config(&self) -> KafkaBusConfig {
        KafkaBusConfig {
            hosts: self.kafka_hosts.clone(),
            consumer_group: self.kafka_consumer_group.clone(),
            topic: self.kafka_consumer_topic.clone(),
            offset_reset: self.kafka_consumer_offset_reset.clone(),
            tls: self.kafka_tls,
            connect_timeout: Duration::from_millis(self.kafka_connect_timeout_ms),
            identity_source: self.identity_source,
        }
    }

    pub fn clickhouse_config(&self) -> ClickHouseConfig {
        ClickHouseConfig {
            url: self.clickhouse_url.clone(),
            database: self.clickhouse_database.clone(),
            user: self.clickhouse_user.clone(),
            password: self.clickhouse_password.clone(),
            table: self.clickhouse_table.clone(),
        }
    }
}
