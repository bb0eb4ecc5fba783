use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus exporter and register all application metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;

    register_metrics();
    Ok(handle)
}

/// Pre-register metrics so they appear even before the first update.
pub fn register_metrics() {
    counter!("monitor_ticks_total").absolute(0);
    counter!("decryption_failures_total").absolute(0);
    counter!("price_failures_total").absolute(0);
    counter!("evaluation_timeouts_total").absolute(0);

    gauge!("open_positions").set(0.0);
    gauge!("monitor_consecutive_failures").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("monitor_tick_seconds").record(0.0);
}
