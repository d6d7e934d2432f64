use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::broker::{Broker, BrokerSession, ConsumeSpec, DeclaredQueue, QueueSpec};
use super::channel::ChannelError;
use super::connection::{ConnectionDescriptor, ConnectionError};
use super::dispatch::{DispatchLoop, DispatchMode};
use super::handler::MessageHandler;
use super::watcher::{ConnectionClosed, FailureWatcher};
use crate::metrics::Metrics;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Lower bound for the retry delay; failed dials are never retried back to back.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Declaring,
    Subscribing,
    Consuming,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Declaring => "declaring",
            Self::Subscribing => "subscribing",
            Self::Consuming => "consuming",
        };
        f.write_str(name)
    }
}

/// A session that has been dialed and has its queue declared.
struct Established<S> {
    session: S,
    queue: DeclaredQueue,
    watcher: FailureWatcher,
}

/// Keeps a subscription to one queue alive for as long as the process runs.
///
/// A single owner task holds the current session. The failure watcher and the
/// dispatch loop only talk back to it through the watcher's one-shot signal, so
/// a new cycle starts only after the previous connection is gone.
pub struct ResilientConsumer<B: Broker> {
    broker: B,
    descriptor: Arc<ConnectionDescriptor>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<Metrics>,
    reconnect_delay: Duration,
    dispatch_mode: DispatchMode,
    queue_spec: QueueSpec,
    consume_spec: ConsumeSpec,
    state: watch::Sender<ConsumerState>,
}

impl<B: Broker> ResilientConsumer<B> {
    pub fn new(
        broker: B,
        descriptor: Arc<ConnectionDescriptor>,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let queue_spec = QueueSpec::durable(descriptor.queue_name());
        let (state, _) = watch::channel(ConsumerState::Connecting);

        Self {
            broker,
            descriptor,
            handler,
            metrics,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            dispatch_mode: DispatchMode::default(),
            queue_spec,
            consume_spec: ConsumeSpec::default(),
            state,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay.max(MIN_RECONNECT_DELAY);
        self
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Spawns the connect/consume lifecycle and returns immediately.
    ///
    /// If registering the consumer fails on a healthy connection the process
    /// exits with status 1.
    pub fn start(self) -> ConsumerHandle {
        let state = self.state();
        let queue = self.descriptor.queue_name().to_string();

        let task = tokio::spawn(async move {
            match self.run().await {
                Ok(never) => match never {},
                Err(e) => {
                    error!(error = %e, queue = %queue, "Couldn't subscribe to queue, exiting");
                    std::process::exit(1);
                }
            }
        });

        ConsumerHandle { state, task }
    }

    /// Runs the lifecycle on the current task. Only returns on a fatal error.
    pub async fn run(self) -> Result<Infallible, ConsumerError> {
        let mut cause: Option<ConnectionClosed> = None;

        loop {
            if let Some(closed) = cause.take() {
                warn!(
                    queue = %self.queue_spec.name,
                    reason = closed.reason.as_deref().unwrap_or("none"),
                    "Trying to reconnect, because of closed connection"
                );
                self.metrics.reconnects_total.inc();
            }

            let established = self.establish().await;

            self.set_state(ConsumerState::Subscribing);
            let deliveries = established
                .session
                .consume(&established.queue, &self.consume_spec)
                .await?;

            tokio::spawn(
                DispatchLoop::new(
                    deliveries,
                    self.handler.clone(),
                    self.dispatch_mode,
                    self.metrics.clone(),
                )
                .run(),
            );

            self.metrics.connected.set(1.0);
            self.set_state(ConsumerState::Consuming);
            info!(
                queue = %established.queue.name,
                "Connection to rabbitmq is established, listening to messages..."
            );

            let Established { session, watcher, .. } = established;
            cause = Some(watcher.closed().await);

            self.metrics.connected.set(0.0);
            // Superseded; the next cycle opens a fresh connection.
            drop(session);
        }
    }

    /// Retries [`Self::connect_once`] at a fixed delay until it succeeds.
    async fn establish(&self) -> Established<B::Session> {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            match self.connect_once().await {
                Ok(established) => {
                    if attempt > 1 {
                        info!(attempt, "Connected after retrying");
                    }
                    return established;
                }
                Err(e) => {
                    self.metrics.connection_attempts_failed_total.inc();
                    error!(
                        error = %e,
                        attempt,
                        retry_in_secs = self.reconnect_delay.as_secs_f64(),
                        "Failed to connect. Retrying..."
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<Established<B::Session>, ConnectError> {
        self.set_state(ConsumerState::Connecting);
        let session = self.broker.connect(self.descriptor.uri()).await?;
        let watcher = session.failure_watcher();

        self.set_state(ConsumerState::Declaring);
        let queue = session.declare_queue(&self.queue_spec).await?;

        Ok(Established {
            session,
            queue,
            watcher,
        })
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }
}

/// Returned by [`ResilientConsumer::start`].
pub struct ConsumerHandle {
    pub state: watch::Receiver<ConsumerState>,
    pub task: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(String),

    #[error("Failed to receive delivery: {0}")]
    DeliveryFailed(String),
}

/// Why a single connect-and-declare attempt failed. Always retried.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Declare(#[from] ChannelError),
}
