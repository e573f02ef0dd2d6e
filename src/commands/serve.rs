use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{Instrument, error, info, warn};

use bustrack::actions::status;
use bustrack::relay::RelayEngine;
use bustrack::relay_config::RelayConfig;
use bustrack::web::{self, AppState};

#[tracing::instrument(skip_all)]
pub async fn handle_serve(config: RelayConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "serve");
    });

    config.validate().context("Invalid relay configuration")?;
    info!(
        "Relay settings: broadcast_capacity={}, heartbeat={}s, idle_timeout={}s, audit_interval={}s",
        config.broadcast_capacity,
        config.heartbeat_interval_secs,
        config.idle_timeout_secs,
        config.audit_interval_secs
    );

    // Metrics must be initialized before the metrics server starts so the
    // first scrape already sees every series
    if let Some(metrics_port) = config.metrics_port {
        let handle = bustrack::metrics::init_metrics()?;
        bustrack::metrics::initialize_relay_metrics();
        tokio::spawn(
            async move {
                if let Err(e) = bustrack::metrics::start_metrics_server(metrics_port, handle).await
                {
                    error!("Metrics server stopped: {:#}", e);
                }
            }
            .instrument(tracing::info_span!("metrics_server")),
        );
    }

    status::init_server_start_time();

    let relay = RelayEngine::new(config.broadcast_capacity);

    if let Some(interval) = config.audit_interval() {
        tokio::spawn(
            consistency_audit_task(relay.clone(), interval)
                .instrument(tracing::info_span!("consistency_audit")),
        );
    }

    web::start_web_server(AppState::new(relay, config), shutdown_signal()).await
}

/// Periodically drop snapshots whose owner no longer claims them
async fn consistency_audit_task(relay: RelayEngine, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let repaired = relay.reconcile().await;
        if !repaired.is_empty() {
            warn!(
                "Consistency audit took {} vehicles offline: {:?}",
                repaired.len(),
                repaired
            );
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                }
                return;
            }
            _ => {
                error!("Failed to register unix signal handlers, falling back to Ctrl+C");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT (Ctrl+C), shutting down..."),
        Err(err) => {
            error!("Failed to listen for SIGINT signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
