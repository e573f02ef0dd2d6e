use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Install the Prometheus recorder and return a handle for rendering scrapes
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
        .set_buckets_for_metric(
            Matcher::Full("http_request_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .context("Failed to set buckets for http_request_duration_seconds")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Initialize relay metrics to zero so they show up before the first event
pub fn initialize_relay_metrics() {
    metrics::gauge!("relay.connections.active").set(0.0);
    metrics::gauge!("relay.vehicles.active").set(0.0);
    metrics::counter!("relay.connections.idle_timeout_total").absolute(0);

    metrics::counter!("relay.reports.accepted_total").absolute(0);
    metrics::counter!("relay.reports.rejected_total").absolute(0);
    metrics::counter!("relay.ownership.takeover_total").absolute(0);

    metrics::counter!("relay.fanout.published_total").absolute(0);
    metrics::counter!("relay.fanout.lagged_total").absolute(0);

    metrics::counter!("relay.consistency.repaired_total").absolute(0);
}

/// Resident set size in bytes from a `/proc/self/status` dump
fn parse_rss_bytes(status: &str) -> Option<f64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<f64>().ok()?;
    Some(kb * 1024.0)
}

/// Background task to update process metrics every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Some(bytes) = std::fs::read_to_string("/proc/self/status")
                .ok()
                .as_deref()
                .and_then(parse_rss_bytes)
            {
                metrics::gauge!("process.memory.bytes").set(bytes);
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Serve `/metrics` on its own port
pub async fn start_metrics_server(port: u16, handle: PrometheusHandle) -> Result<()> {
    tokio::spawn(process_metrics_task());

    let app = Router::new().route("/metrics", get(move || async move { handle.render() }));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;

    axum::serve(listener, app)
        .await
        .context("Metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rss_bytes() {
        let status = "Name:\tbustrack\nVmPeak:\t  20000 kB\nVmRSS:\t    1024 kB\nThreads:\t8\n";
        assert_eq!(parse_rss_bytes(status), Some(1024.0 * 1024.0));
    }

    #[test]
    fn test_parse_rss_bytes_missing() {
        assert_eq!(parse_rss_bytes("Name:\tbustrack\n"), None);
        assert_eq!(parse_rss_bytes("VmRSS:\tgarbage kB\n"), None);
    }
}
