use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{BusClient, Delivery, DeliveryHandler};
use crate::error::ConsumerError;
use crate::metrics_consts::{CONSUMER_RUNNING, DELIVERIES_DROPPED};
use crate::processor::DeduplicatingProcessor;
use crate::sink::Sink;

/// Lifecycle of a [`Consumer`]. A consumer only ever moves forward through
/// these states and runs once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Subscribing,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Subscribing => "subscribing",
            ConsumerState::Running => "running",
            ConsumerState::Draining => "draining",
            ConsumerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Owns the bus connection and feeds every delivery into the processor.
pub struct Consumer<B, S> {
    bus: B,
    processor: Arc<DeduplicatingProcessor<S>>,
    state: watch::Sender<ConsumerState>,
}

impl<B, S> Consumer<B, S>
where
    B: BusClient,
    S: Sink + 'static,
{
    pub fn new(bus: B, processor: Arc<DeduplicatingProcessor<S>>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            bus,
            processor,
            state,
        }
    }

    /// Subscribe to state transitions, e.g. for a readiness probe.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn processor(&self) -> &Arc<DeduplicatingProcessor<S>> {
        &self.processor
    }

    /// Connect, subscribe, and run until `shutdown` is cancelled.
    ///
    /// Never returns `Ok`: a consumer that ran to completion reports
    /// [`ConsumerError::Cancelled`]. Connect and subscribe failures are
    /// returned as soon as they happen, and a failed subscribe disconnects
    /// before returning.
    pub async fn start(&mut self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        if self.current_state() != ConsumerState::Idle {
            return Err(ConsumerError::AlreadyStarted);
        }

        if shutdown.is_cancelled() {
            info!("Consumer cancelled before connecting");
            self.transition(ConsumerState::Terminated);
            return Err(ConsumerError::Cancelled);
        }

        self.transition(ConsumerState::Connecting);
        if let Err(e) = self.bus.connect().await {
            error!(error = ?e, "Failed to connect to the bus");
            self.transition(ConsumerState::Terminated);
            return Err(ConsumerError::Connection(e));
        }

        self.transition(ConsumerState::Subscribing);
        let handler = delivery_handler(self.processor.clone());
        if let Err(e) = self.bus.subscribe(handler).await {
            error!(error = ?e, "Failed to subscribe, disconnecting");
            if let Err(disconnect_err) = self.bus.disconnect().await {
                warn!(error = ?disconnect_err, "Disconnect after failed subscribe also failed");
            }
            self.transition(ConsumerState::Terminated);
            return Err(ConsumerError::Subscription(e));
        }

        self.transition(ConsumerState::Running);
        metrics::gauge!(CONSUMER_RUNNING).set(1.0);

        shutdown.cancelled().await;

        info!("Shutdown signal received, draining consumer");
        self.transition(ConsumerState::Draining);
        metrics::gauge!(CONSUMER_RUNNING).set(0.0);

        if let Err(e) = self.bus.disconnect().await {
            warn!(error = ?e, "Failed to disconnect cleanly from the bus");
        }

        self.transition(ConsumerState::Terminated);
        info!("Consumer stopped");

        Err(ConsumerError::Cancelled)
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        info!("Consumer state: {} -> {}", previous, next);
    }
}

// Sink errors stop here: there is no way to negatively acknowledge a
// delivery, so they are logged and counted.
fn delivery_handler<S: Sink + 'static>(
    processor: Arc<DeduplicatingProcessor<S>>,
) -> DeliveryHandler {
    Arc::new(move |delivery: Delivery| -> BoxFuture<'static, ()> {
        let processor = processor.clone();
        Box::pin(async move {
            if let Err(e) = processor
                .process(&delivery.identity, delivery.payload)
                .await
            {
                warn!(
                    error = ?e,
                    "Dropping delivery {} after sink failure, it will not be retried",
                    delivery.identity
                );
                metrics::counter!(DELIVERIES_DROPPED).increment(1);
            }
        })
    })
}
