/// Counter of deliveries handed to the processor by the bus callback
pub const DELIVERIES_RECEIVED: &str = "ingest_deliveries_received_total";

/// Counter of deliveries whose sink write failed and were dropped
pub const DELIVERIES_DROPPED: &str = "ingest_deliveries_dropped_total";

/// Counter of processed events, labelled with `outcome` (written/duplicate/sink_error)
pub const EVENTS_PROCESSED: &str = "ingest_events_processed_total";

/// Histogram of sink write latency in milliseconds
pub const SINK_WRITE_DURATION_MS: &str = "ingest_sink_write_duration_ms";

/// Gauge of identities currently retained by the seen-set
pub const SEEN_IDENTITIES: &str = "ingest_seen_identities";

/// Gauge set to 1 while the consumer is subscribed and running
pub const CONSUMER_RUNNING: &str = "ingest_consumer_running";
