use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use lapin::ConnectionProperties;
use tokio::sync::Notify;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::Config;
use queue_listener::contracts::QueueMessage;
use queue_listener::messaging::{
    Delivery, HandlerError, MessageHandler, RabbitMqBroker, ResilientConsumer,
};
use queue_listener::metrics::{server::start_server, Metrics};

const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct QueueMessageHandler;

#[async_trait]
impl MessageHandler for QueueMessageHandler {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        let message = QueueMessage::from_slice(&delivery.data)?;

        info!(
            id = %message.data.id,
            routing_key = %delivery.routing_key,
            "You received message: {}",
            message.data.message
        );

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Couldn't load env variables: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.queue_name,
        host = %config.rabbitmq_host,
        "Queue listener starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("Failed to create metrics: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(Notify::new());
    let server_handle = {
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        let port = config.server_port;
        tokio::spawn(async move {
            if let Err(e) = start_server(metrics, port, shutdown).await {
                error!(error = %e, "HTTP server error");
                std::process::exit(1);
            }
        })
    };

    let consumer = ResilientConsumer::new(
        RabbitMqBroker::with_properties(
            ConnectionProperties::default().with_connection_name(env!("CARGO_PKG_NAME").into()),
        ),
        Arc::new(config.descriptor()),
        Arc::new(QueueMessageHandler),
        metrics,
    )
    .with_reconnect_delay(config.reconnect_delay)
    .with_dispatch_mode(config.dispatch_mode());

    // The consumer keeps running until the process exits; it is not part of
    // the shutdown sequence below.
    let _consumer = consumer.start();

    wait_for_shutdown_signal().await;

    warn!("Shutdown signal received, stopping HTTP server...");
    shutdown.notify_one();

    if let Err(e) = tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, server_handle).await {
        warn!(error = ?e, "HTTP server shutdown timeout");
    }

    info!("Bye, see you next time!");
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn setup_logging(rust_log: &str) {
    let log_level = match rust_log.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
