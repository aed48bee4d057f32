use std::sync::Arc;

use anyhow::Context;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use pubsub_relay::channels::{DeliverySink, SlackSink};
use pubsub_relay::config::Config;
use pubsub_relay::metrics::RelayMetrics;
use pubsub_relay::pubsub::{GcpSubscription, Subscription};
use pubsub_relay::relay::{Relay, error_channel, log_error_events};
use pubsub_relay::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to get config")?;

    // Initialize tracing
    let filter = match config.log_level.as_deref() {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)
            .with_context(|| format!("unable to parse level {level:?}"))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        subscription = %config.pubsub.subscription_path(),
        channel = %config.relay.channel,
        metadata_keys = ?config.relay.metadata_keys,
        recency_window = ?config.relay.ignore_messages_older_than,
        "Starting pubsub-relay"
    );

    // ── Metrics ─────────────────────────────────────────────────────────
    let registry = Registry::new();
    let metrics = Arc::new(
        RelayMetrics::new(&config.metrics_namespace).context("creating metrics")?,
    );
    metrics.register(&registry).context("registering metrics")?;

    // ── Subscription ────────────────────────────────────────────────────
    let subscription_path = config.pubsub.subscription_path();
    let subscription: Arc<dyn Subscription> = Arc::new(
        GcpSubscription::open(config.pubsub.clone())
            .await
            .with_context(|| format!("opening subscription {subscription_path}"))?,
    );
    tracing::debug!(subscription = %subscription_path, "connected to Pub/Sub subscription");

    // ── Sink ────────────────────────────────────────────────────────────
    let sink: Arc<dyn DeliverySink> =
        Arc::new(SlackSink::new(config.slack.clone()).context("building Slack client")?);
    if let Err(e) = sink.health_check().await {
        tracing::warn!(error = %e, "Slack credential check failed; deliveries may fail");
    }

    // ── Error consumer ──────────────────────────────────────────────────
    let (reporter, error_rx) =
        error_channel(config.relay.error_channel_capacity, Arc::clone(&metrics));
    let error_consumer = tokio::spawn(log_error_events(error_rx));

    // ── Relay ───────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let relay = Relay::new(
        Arc::clone(&subscription),
        sink,
        config.relay.clone(),
        reporter,
    );
    let relay_cancel = cancel.clone();
    let relay_handle = tokio::spawn(async move { relay.run(relay_cancel).await });

    // ── HTTP ────────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, server::routes(registry), server_cancel).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutting down");
    cancel.cancel();

    if let Err(e) = relay_handle.await {
        tracing::error!(error = %e, "Relay task failed");
    }
    if let Err(e) = subscription.shutdown().await {
        tracing::error!(error = %e, "shutting down subscription");
    }
    // Reporters die with the relay; detached deliveries may still hold one.
    if tokio::time::timeout(config.relay.shutdown_timeout, error_consumer)
        .await
        .is_err()
    {
        tracing::warn!("Error consumer still running at exit");
    }
    if let Err(e) = server_handle.await {
        tracing::error!(error = %e, "HTTP server task failed");
    }

    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
