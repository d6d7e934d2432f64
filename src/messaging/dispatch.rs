use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use super::broker::DeliveryStream;
use super::delivery::Delivery;
use super::handler::MessageHandler;
use crate::metrics::Metrics;

const PAYLOAD_PREVIEW_CHARS: usize = 100;

/// How many handler invocations may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One task per delivery, no cap.
    #[default]
    Unbounded,
    /// At most `n` handlers in flight; reading pauses while all slots are busy.
    Bounded(usize),
}

pub struct DispatchLoop {
    deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    limit: Option<Arc<Semaphore>>,
    metrics: Arc<Metrics>,
}

impl DispatchLoop {
    pub fn new(
        deliveries: DeliveryStream,
        handler: Arc<dyn MessageHandler>,
        mode: DispatchMode,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limit = match mode {
            DispatchMode::Unbounded => None,
            DispatchMode::Bounded(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
        };

        Self {
            deliveries,
            handler,
            limit,
            metrics,
        }
    }

    /// Drains the stream until the broker side closes it.
    pub async fn run(self) {
        let Self {
            mut deliveries,
            handler,
            limit,
            metrics,
        } = self;

        while let Some(next) = deliveries.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(error = %e, "Error receiving message from RabbitMQ");
                    continue;
                }
            };

            let permit = match &limit {
                Some(limit) => limit.clone().acquire_owned().await.ok(),
                None => None,
            };

            metrics.messages_received_total.inc();
            debug!(
                delivery_tag = delivery.delivery_tag,
                routing_key = %delivery.routing_key,
                payload_size = delivery.data.len(),
                "Dispatching message"
            );

            tokio::spawn(invoke(handler.clone(), delivery, metrics.clone(), permit));
        }

        warn!("Delivery stream closed");
    }
}

async fn invoke(
    handler: Arc<dyn MessageHandler>,
    delivery: Delivery,
    metrics: Arc<Metrics>,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let delivery_tag = delivery.delivery_tag;
    let preview = delivery.payload_preview(PAYLOAD_PREVIEW_CHARS);

    metrics.handlers_in_flight.inc();
    let start = Instant::now();

    let outcome = AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await;

    let duration = start.elapsed().as_secs_f64();
    metrics.handlers_in_flight.dec();

    let status = match outcome {
        Ok(Ok(())) => "success",
        Ok(Err(e)) => {
            warn!(
                delivery_tag,
                error = %e,
                payload_preview = %preview,
                "Message handler returned an error"
            );
            metrics.messages_failed_total.with_label_values(&[e.kind()]).inc();
            "error"
        }
        Err(panic) => {
            error!(
                delivery_tag,
                panic = %panic_message(panic.as_ref()),
                payload_preview = %preview,
                "Message handler panicked"
            );
            metrics.messages_failed_total.with_label_values(&["panic"]).inc();
            "panic"
        }
    };

    metrics
        .message_processing_duration_seconds
        .with_label_values(&[status])
        .observe(duration);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::consumer::ConsumerError;
    use crate::messaging::handler::{handler_fn, HandlerError};
    use futures::channel::mpsc as stream_mpsc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    type Feed = stream_mpsc::UnboundedSender<Result<Delivery, ConsumerError>>;

    fn feed() -> (Feed, DeliveryStream) {
        let (tx, rx) = stream_mpsc::unbounded();
        (tx, rx.boxed())
    }

    fn recording_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                match delivery.data.as_slice() {
                    b"stall" => std::future::pending::<()>().await,
                    b"fail" => return Err(HandlerError::Failed("boom".to_string())),
                    b"panic" => panic!("handler exploded"),
                    _ => {}
                }
                let _ = tx.send(delivery.data);
                Ok(())
            }
        }));
        (handler, rx)
    }

    async fn next_payload(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler was not invoked")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn test_stalled_handler_does_not_block_later_deliveries() {
        let (tx, stream) = feed();
        let (handler, mut rx) = recording_handler();
        let metrics = Metrics::new().unwrap();
        tokio::spawn(DispatchLoop::new(stream, handler, DispatchMode::Unbounded, metrics.clone()).run());

        tx.unbounded_send(Ok(Delivery::new("stall"))).unwrap();
        tx.unbounded_send(Ok(Delivery::new("second"))).unwrap();
        tx.unbounded_send(Ok(Delivery::new("third"))).unwrap();

        let mut seen = vec![next_payload(&mut rx).await, next_payload(&mut rx).await];
        seen.sort();
        assert_eq!(seen, vec![b"second".to_vec(), b"third".to_vec()]);
        assert_eq!(metrics.messages_received_total.get(), 3.0);
    }

    #[tokio::test]
    async fn test_handler_failures_are_isolated() {
        let (tx, stream) = feed();
        let (handler, mut rx) = recording_handler();
        let metrics = Metrics::new().unwrap();
        tokio::spawn(DispatchLoop::new(stream, handler, DispatchMode::Unbounded, metrics.clone()).run());

        tx.unbounded_send(Ok(Delivery::new("fail"))).unwrap();
        tx.unbounded_send(Ok(Delivery::new("panic"))).unwrap();
        tx.unbounded_send(Ok(Delivery::new("after"))).unwrap();

        assert_eq!(next_payload(&mut rx).await, b"after".to_vec());

        // Failure counters are updated once the failing tasks have finished.
        for _ in 0..100 {
            let failed = metrics.messages_failed_total.with_label_values(&["failed"]).get();
            let panicked = metrics.messages_failed_total.with_label_values(&["panic"]).get();
            if failed == 1.0 && panicked == 1.0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("failure counters were not updated");
    }

    #[tokio::test]
    async fn test_stream_errors_are_skipped() {
        let (tx, stream) = feed();
        let (handler, mut rx) = recording_handler();
        let metrics = Metrics::new().unwrap();
        tokio::spawn(DispatchLoop::new(stream, handler, DispatchMode::Unbounded, metrics).run());

        tx.unbounded_send(Err(ConsumerError::DeliveryFailed("frame error".to_string())))
            .unwrap();
        tx.unbounded_send(Ok(Delivery::new("ok"))).unwrap();

        assert_eq!(next_payload(&mut rx).await, b"ok".to_vec());
    }

    #[tokio::test]
    async fn test_loop_ends_when_stream_closes() {
        let (tx, stream) = feed();
        let (handler, _rx) = recording_handler();
        let task = tokio::spawn(
            DispatchLoop::new(stream, handler, DispatchMode::Unbounded, Metrics::new().unwrap()).run(),
        );

        drop(tx);

        timeout(Duration::from_secs(5), task)
            .await
            .expect("dispatch loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bounded_mode_caps_in_flight_handlers() {
        let (tx, stream) = feed();
        let (handler, mut rx) = recording_handler();
        let metrics = Metrics::new().unwrap();
        tokio::spawn(DispatchLoop::new(stream, handler, DispatchMode::Bounded(1), metrics.clone()).run());

        tx.unbounded_send(Ok(Delivery::new("stall"))).unwrap();
        tx.unbounded_send(Ok(Delivery::new("blocked"))).unwrap();

        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        assert_eq!(metrics.messages_received_total.get(), 1.0);
        assert_eq!(metrics.handlers_in_flight.get(), 1.0);
    }

    #[test]
    fn test_panic_message_extraction() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(static_str.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "Unknown panic payload");
    }
}
