//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a transfer being started or resumed
pub fn record_download_started(repo: &str) {
    metrics::counter!("model_cache_downloads_started_total",
        "repo" => repo.to_string()
    )
    .increment(1);
}

/// Record a repository installed and validated
pub fn record_download_finished(repo: &str) {
    metrics::counter!("model_cache_downloads_finished_total",
        "repo" => repo.to_string()
    )
    .increment(1);
}

pub fn record_download_failed(repo: &str) {
    metrics::counter!("model_cache_downloads_failed_total",
        "repo" => repo.to_string()
    )
    .increment(1);
}

pub fn record_download_paused(repo: &str) {
    metrics::counter!("model_cache_downloads_paused_total",
        "repo" => repo.to_string()
    )
    .increment(1);
}

pub fn record_download_removed(repo: &str) {
    metrics::counter!("model_cache_downloads_removed_total",
        "repo" => repo.to_string()
    )
    .increment(1);
}

/// Record bytes written to blob storage
pub fn record_bytes_downloaded(repo: &str, bytes: u64) {
    metrics::counter!("model_cache_bytes_downloaded_total",
        "repo" => repo.to_string()
    )
    .increment(bytes);
}

/// Record an installation that had to copy because symlinks were refused
pub fn record_install_copy_fallback() {
    metrics::counter!("model_cache_install_copy_fallbacks_total").increment(1);
}

/// Update active transfer gauge
pub fn update_active_downloads(count: usize) {
    metrics::gauge!("model_cache_active_downloads").set(count as f64);
}
