//! Maildispatch service - HTTP intake, durable queue poller and the
//! rate-limited dispatch pipeline in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use maildispatch::web::{self, AppState};
use maildispatch::{
    AmqpQueue, Config, Intake, LogTransport, MailgunTransport, Pipeline, Poller, SqliteStore,
    Store, Transport, TransportKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("maildispatch_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        rate_per_second = config.rate_per_second,
        bulk_size = config.bulk_size,
        transport = ?config.transport,
        amqp_configured = config.amqp_url.is_some(),
        mailgun_signing_configured = config.mailgun_signing_key.is_some(),
        "config_loaded"
    );

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .context("Failed to open database")?,
    );

    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Mailgun => Arc::new(
            MailgunTransport::from_config(&config).context("Failed to configure Mailgun")?,
        ),
        TransportKind::Log => Arc::new(LogTransport::new()),
    };

    let shutdown = CancellationToken::new();
    let pipeline = Pipeline::start(&config, store.clone(), transport, shutdown.clone());
    let intake = Intake::new(store.clone(), pipeline.queue());

    // Optional durable queue ingress
    let mut durable = None;
    if let Some(url) = &config.amqp_url {
        let queue = Arc::new(
            AmqpQueue::get_or_create(url, &config.durable_queue_name)
                .await
                .context("Failed to open durable queue")?,
        );
        let poller = Poller::new(queue.clone(), intake.clone(), shutdown.clone());
        durable = Some((queue, tokio::spawn(poller.run())));
    }

    if config.mailgun_signing_key.is_none() {
        warn!("result_events_unsigned");
    }
    let state = AppState::new(store, intake, shutdown.clone()).with_signing_key(
        config.mailgun_signing_key.as_deref(),
        config.mailgun_signature_max_age,
    );
    let app = web::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await
        .context("Server error")?;

    // The server may also stop on its own; make sure every worker sees it.
    shutdown.cancel();

    if let Some((queue, poller)) = durable {
        match poller.await {
            Ok(handled) => info!(handled = handled, "poller_stopped"),
            Err(e) => error!(error = %e, "poller_task_failed"),
        }
        queue.close().await;
    }

    let report = pipeline.join().await.context("Pipeline task failed")?;
    info!(
        dispatched = report.dispatch.dispatched,
        drained = report.dispatch.drained,
        abandoned = report.dispatch.abandoned,
        outcomes_written = report.aggregate.outcomes_written,
        outcomes_dropped = report.aggregate.outcomes_dropped,
        "maildispatch_shutdown_complete"
    );

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("maildispatch_shutting_down");
}
