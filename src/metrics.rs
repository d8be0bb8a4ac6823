//! Metrics (§A "Metrics"): installs the Prometheus recorder/exporter and
//! records the counters the share processor and payout processor already
//! track internally. No dashboard or HTTP API beyond the exporter's own
//! tiny built-in listener — that's ambient observability, not the excluded
//! web front end.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Installs the global recorder and starts its built-in `/metrics` listener.
/// Call once, at process startup, before any `metrics::counter!`/`gauge!`
/// call fires.
pub fn install(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

/// Mirrors one `ShareProcessorStats` snapshot into gauges, so the counters
/// C6 already keeps in memory are visible to Prometheus without every call
/// site having to know about metrics.
pub fn record_share_stats(coin: &str, stats: &crate::share_processor::ShareProcessorStats) {
    use std::sync::atomic::Ordering;
    metrics::gauge!("pool_valid_shares_total", "coin" => coin.to_string())
        .set(stats.valid_shares.load(Ordering::Relaxed) as f64);
    metrics::gauge!("pool_invalid_shares_total", "coin" => coin.to_string())
        .set(stats.invalid_shares.load(Ordering::Relaxed) as f64);
    metrics::gauge!("pool_valid_blocks_total", "coin" => coin.to_string())
        .set(stats.valid_blocks.load(Ordering::Relaxed) as f64);
    metrics::gauge!("pool_invalid_blocks_total", "coin" => coin.to_string())
        .set(stats.invalid_blocks.load(Ordering::Relaxed) as f64);
}

pub fn record_connected_clients(coin: &str, port: u16, count: usize) {
    metrics::gauge!("pool_connected_clients", "coin" => coin.to_string(), "port" => port.to_string())
        .set(count as f64);
}

/// Spawns a periodic sampler that mirrors every coin's live counters into
/// the exporter, the way the teacher's metrics collector polls at a fixed
/// interval rather than pushing on every event.
pub fn spawn_sampler<S: crate::store::Store + 'static>(
    supervisor: std::sync::Arc<crate::supervisor::Supervisor<S>>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            supervisor.sample_metrics();
        }
    })
}
