//! Scriptable in-memory [`Broker`] for lifecycle tests.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::broker::{
    Broker, BrokerSession, ConsumeSpec, DeclaredQueue, DeliveryStream, QueueSpec,
};
use super::channel::ChannelError;
use super::connection::ConnectionError;
use super::consumer::ConsumerError;
use super::delivery::Delivery;
use super::watcher::{
    close_on_stream_end, failure_watch, CloseNotifier, ConnectionClosed, FailureWatcher,
};

type Feed = mpsc::UnboundedSender<Result<Delivery, ConsumerError>>;

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    dial_failures: usize,
    declare_failures: usize,
    consume_fails: bool,
    dial_attempts: usize,
    declared: Vec<QueueSpec>,
    consume_specs: Vec<ConsumeSpec>,
    next_session: u64,
    latest_session: Option<u64>,
    active_sessions: usize,
    max_active_sessions: usize,
    notifiers: HashMap<u64, Arc<CloseNotifier>>,
    closed: HashSet<u64>,
    feeds: HashMap<u64, Feed>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_dials(self, count: usize) -> Self {
        self.state().dial_failures = count;
        self
    }

    pub(crate) fn fail_declares(self, count: usize) -> Self {
        self.state().declare_failures = count;
        self
    }

    pub(crate) fn fail_consume(self) -> Self {
        self.state().consume_fails = true;
        self
    }

    pub(crate) fn dial_attempts(&self) -> usize {
        self.state().dial_attempts
    }

    pub(crate) fn declared(&self) -> Vec<QueueSpec> {
        self.state().declared.clone()
    }

    pub(crate) fn consume_specs(&self) -> Vec<ConsumeSpec> {
        self.state().consume_specs.clone()
    }

    pub(crate) fn consumers(&self) -> usize {
        self.state().consume_specs.len()
    }

    pub(crate) fn max_active_sessions(&self) -> usize {
        self.state().max_active_sessions
    }

    /// Pushes a delivery onto the most recent subscription.
    pub(crate) fn publish(&self, delivery: Delivery) {
        let state = self.state();
        let feed = state
            .latest_session
            .and_then(|id| state.feeds.get(&id))
            .expect("no active subscription");
        feed.unbounded_send(Ok(delivery)).expect("subscription closed");
    }

    /// Simulates the broker dropping the most recent connection.
    pub(crate) fn close_current(&self, reason: Option<&str>) {
        let mut state = self.state();
        let id = state.latest_session.expect("no session to close");
        state.feeds.remove(&id);
        let notifier = state.notifiers.remove(&id);
        drop(state);

        if let Some(notifier) = notifier {
            notifier.notify(ConnectionClosed {
                reason: reason.map(str::to_string),
            });
        }
    }

    /// Simulates a clean broker-side close: the subscription ends but the
    /// error callback never runs.
    pub(crate) fn close_current_cleanly(&self) {
        let mut state = self.state();
        let id = state.latest_session.expect("no session to close");
        state.closed.insert(id);
        state.feeds.remove(&id);
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    type Session = FakeSession;

    async fn connect(&self, _uri: &str) -> Result<Self::Session, ConnectionError> {
        let mut state = self.state();
        state.dial_attempts += 1;

        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(ConnectionError::ConnectionFailed(
                "Connection refused (os error 111)".to_string(),
            ));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.latest_session = Some(id);
        state.active_sessions += 1;
        state.max_active_sessions = state.max_active_sessions.max(state.active_sessions);

        Ok(FakeSession {
            id,
            inner: self.inner.clone(),
        })
    }
}

pub(crate) struct FakeSession {
    id: u64,
    inner: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, ChannelError> {
        let mut state = self.state();
        state.declared.push(spec.clone());

        if state.declare_failures > 0 {
            state.declare_failures -= 1;
            return Err(ChannelError::DeclareFailed(
                "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
            ));
        }

        Ok(DeclaredQueue {
            name: spec.name.clone(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn consume(
        &self,
        _queue: &DeclaredQueue,
        spec: &ConsumeSpec,
    ) -> Result<DeliveryStream, ConsumerError> {
        let mut state = self.state();

        if state.consume_fails {
            return Err(ConsumerError::ConsumeFailed(
                "ACCESS_REFUSED - queue in exclusive use".to_string(),
            ));
        }

        state.consume_specs.push(spec.clone());
        let (tx, rx) = mpsc::unbounded();
        state.feeds.insert(self.id, tx);

        let deliveries: DeliveryStream = rx.boxed();
        Ok(match state.notifiers.get(&self.id) {
            Some(notifier) => {
                let inner = self.inner.clone();
                let id = self.id;
                close_on_stream_end(deliveries, notifier.clone(), move || {
                    inner.lock().map(|state| state.closed.contains(&id)).unwrap_or(true)
                })
            }
            None => deliveries,
        })
    }

    fn failure_watcher(&self) -> FailureWatcher {
        let (notifier, watcher) = failure_watch();
        self.state().notifiers.insert(self.id, Arc::new(notifier));
        watcher
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.lock() {
            state.active_sessions -= 1;
            state.feeds.remove(&self.id);
            state.notifiers.remove(&self.id);
        }
    }
}
