use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub messages_received_total: Counter,
    pub messages_failed_total: CounterVec,
    pub message_processing_duration_seconds: HistogramVec,
    pub handlers_in_flight: Gauge,
    pub connection_attempts_failed_total: Counter,
    pub reconnects_total: Counter,
    pub connected: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_received_total = Counter::new(
            "listener_messages_received_total",
            "Total number of deliveries read from the queue",
        )?;

        let messages_failed_total = CounterVec::new(
            Opts::new(
                "listener_messages_failed_total",
                "Total number of handler invocations that failed",
            ),
            &["kind"],
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "listener_message_processing_duration_seconds",
                "Time taken by the handler to process a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["status"],
        )?;

        let handlers_in_flight = Gauge::new(
            "listener_handlers_in_flight",
            "Number of handler invocations currently running",
        )?;

        let connection_attempts_failed_total = Counter::new(
            "listener_connection_attempts_failed_total",
            "Total number of failed connect-and-declare attempts",
        )?;

        let reconnects_total = Counter::new(
            "listener_reconnects_total",
            "Total number of reconnect cycles triggered by a closed connection",
        )?;

        let connected = Gauge::new(
            "listener_connected",
            "1 while the queue subscription is active, 0 otherwise",
        )?;

        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(handlers_in_flight.clone()))?;
        registry.register(Box::new(connection_attempts_failed_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(connected.clone()))?;

        Ok(Arc::new(Self {
            messages_received_total,
            messages_failed_total,
            message_processing_duration_seconds,
            handlers_in_flight,
            connection_attempts_failed_total,
            reconnects_total,
            connected,
            registry,
        }))
    }
}
