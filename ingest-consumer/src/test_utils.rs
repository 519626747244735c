//! In-memory bus and sink used by the unit and integration tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::bus::{BusClient, Delivery, DeliveryHandler};
use crate::error::{BusError, SinkError};
use crate::sink::Sink;

#[derive(Default)]
struct FakeBusState {
    connected: bool,
    handler: Option<DeliveryHandler>,
    fail_connect: bool,
    fail_subscribe: bool,
    connect_calls: usize,
    subscribe_calls: usize,
    disconnect_calls: usize,
}

/// A bus whose deliveries are pushed by the test through a [`FakeBusHandle`].
pub struct FakeBus {
    state: Arc<Mutex<FakeBusState>>,
}

/// Test-side view of a [`FakeBus`] that stays usable after the bus has been
/// moved into a consumer.
#[derive(Clone)]
pub struct FakeBusHandle {
    state: Arc<Mutex<FakeBusState>>,
}

impl FakeBus {
    pub fn new() -> (Self, FakeBusHandle) {
        let state = Arc::new(Mutex::new(FakeBusState::default()));
        (
            Self {
                state: state.clone(),
            },
            FakeBusHandle { state },
        )
    }

    pub fn failing_connect() -> (Self, FakeBusHandle) {
        let (bus, handle) = Self::new();
        bus.state.lock().fail_connect = true;
        (bus, handle)
    }

    pub fn failing_subscribe() -> (Self, FakeBusHandle) {
        let (bus, handle) = Self::new();
        bus.state.lock().fail_subscribe = true;
        (bus, handle)
    }
}

#[async_trait]
impl BusClient for FakeBus {
    async fn connect(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if state.fail_connect {
            return Err(BusError::Connect("broker unreachable".to_string()));
        }
        if state.connected {
            return Err(BusError::AlreadyConnected);
        }
        state.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, handler: DeliveryHandler) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if !state.connected {
            return Err(BusError::NotConnected);
        }
        if state.fail_subscribe {
            return Err(BusError::Subscribe {
                topic: "events".to_string(),
                reason: "not authorized".to_string(),
            });
        }
        if state.handler.is_some() {
            return Err(BusError::AlreadySubscribed);
        }
        state.handler = Some(handler);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.handler = None;
        state.connected = false;
        Ok(())
    }
}

impl FakeBusHandle {
    /// Push one message through the registered handler and wait for it to be
    /// processed. Returns false when nothing is subscribed.
    pub async fn deliver(&self, identity: &str, payload: &'static [u8]) -> bool {
        let handler = self.state.lock().handler.clone();
        match handler {
            Some(handler) => {
                handler(Delivery::new(identity, Bytes::from_static(payload))).await;
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().handler.is_some()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }
}

#[derive(Default)]
struct RecordingSinkState {
    writes: Vec<(String, Bytes)>,
    attempts: usize,
    failing: HashSet<String>,
}

/// Sink that records successful writes and fails for selected identities.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<RecordingSinkState>>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write sleeps for `delay` before completing, which keeps a write
    /// in flight long enough for racing duplicates to hit the gate.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_identity(&self, identity: &str) {
        self.state.lock().failing.insert(identity.to_string());
    }

    pub fn writes(&self) -> Vec<(String, Bytes)> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self, identity: &str) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(written, _)| written == identity)
            .count()
    }

    /// Number of `write` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write(&self, identity: &str, payload: Bytes) -> Result<(), SinkError> {
        self.state.lock().attempts += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing.contains(identity) {
            return Err(SinkError::Write(format!("insert rejected for {identity}")));
        }
        state.writes.push((identity.to_string(), payload));
        Ok(())
    }
}
