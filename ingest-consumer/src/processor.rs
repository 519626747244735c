use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, field, info_span, Instrument, Span};

use crate::dedup::{RetentionPolicy, SeenSet};
use crate::error::SinkError;
use crate::metrics_consts::{EVENTS_PROCESSED, SEEN_IDENTITIES, SINK_WRITE_DURATION_MS};
use crate::sink::Sink;

/// Forwards each identity to the sink at most once.
///
/// The bus is expected to redeliver; duplicates are absorbed here. An identity
/// is recorded before the sink is called and stays recorded when the write
/// fails, so a failed event is never retried by a later redelivery.
pub struct DeduplicatingProcessor<S> {
    sink: S,
    seen: SeenSet,
}

impl<S: Sink> DeduplicatingProcessor<S> {
    pub fn new(sink: S, policy: RetentionPolicy) -> Self {
        Self {
            sink,
            seen: SeenSet::new(policy),
        }
    }

    /// Process one delivery.
    ///
    /// Returns `Ok(())` for duplicates without touching the sink. Otherwise
    /// returns the result of the sink write. The seen-set lock is released
    /// before the write, so a concurrent duplicate returns immediately
    /// instead of waiting on the winner's write.
    pub async fn process(&self, identity: &str, payload: Bytes) -> Result<(), SinkError> {
        let span = info_span!("process", identity = %identity, outcome = field::Empty);

        async move {
            if !self.seen.check_and_insert(identity) {
                debug!("Identity {} already seen, skipping", identity);
                Span::current().record("outcome", "duplicate");
                metrics::counter!(EVENTS_PROCESSED, "outcome" => "duplicate").increment(1);
                return Ok(());
            }

            metrics::gauge!(SEEN_IDENTITIES).set(self.seen.len() as f64);

            let start = Instant::now();
            let result = self.sink.write(identity, payload).await;
            metrics::histogram!(SINK_WRITE_DURATION_MS)
                .record(start.elapsed().as_millis() as f64);

            match &result {
                Ok(()) => {
                    Span::current().record("outcome", "written");
                    metrics::counter!(EVENTS_PROCESSED, "outcome" => "written").increment(1);
                }
                Err(_) => {
                    // logged by the caller, which decides what a failure means
                    Span::current().record("outcome", "sink_error");
                    metrics::counter!(EVENTS_PROCESSED, "outcome" => "sink_error").increment(1);
                }
            }

            result
        }
        .instrument(span)
        .await
    }

    pub fn has_seen(&self, identity: &str) -> bool {
        self.seen.contains(identity)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
