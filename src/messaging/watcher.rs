use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Why a watched connection went away.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionClosed {
    pub reason: Option<String>,
}

impl ConnectionClosed {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

impl fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "connection closed: {}", reason),
            None => write!(f, "connection closed"),
        }
    }
}

/// Creates a linked notifier/watcher pair for one connection.
pub fn failure_watch() -> (CloseNotifier, FailureWatcher) {
    let (tx, rx) = oneshot::channel();
    (
        CloseNotifier {
            tx: Mutex::new(Some(tx)),
        },
        FailureWatcher { rx },
    )
}

/// Transport side of the watch. Only the first notification is delivered.
pub struct CloseNotifier {
    tx: Mutex<Option<oneshot::Sender<ConnectionClosed>>>,
}

impl CloseNotifier {
    pub fn notify(&self, closed: ConnectionClosed) -> bool {
        let sender = match self.tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(tx) => tx.send(closed).is_ok(),
            None => false,
        }
    }
}

/// Resolves once when the watched connection is gone.
pub struct FailureWatcher {
    rx: oneshot::Receiver<ConnectionClosed>,
}

impl FailureWatcher {
    pub async fn closed(self) -> ConnectionClosed {
        // A dropped notifier means the connection and its callbacks are gone.
        self.rx.await.unwrap_or_default()
    }
}

/// Fires `notifier` when `deliveries` ends while `is_closed` reports the
/// connection gone. Covers clean broker-side closes that never reach the
/// transport's error callback.
pub fn close_on_stream_end<T, F>(
    deliveries: BoxStream<'static, T>,
    notifier: Arc<CloseNotifier>,
    is_closed: F,
) -> BoxStream<'static, T>
where
    T: Send + 'static,
    F: Fn() -> bool + Send + 'static,
{
    let on_end = stream::once(async move {
        if is_closed() {
            notifier.notify(ConnectionClosed::with_reason(
                "delivery stream ended on a closed connection",
            ));
        }
    })
    .filter_map(|()| async { None::<T> });

    deliveries.chain(on_end).boxed()
}
