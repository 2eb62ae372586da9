// Metrics for locks, limiters and the stock runner
// Exposed over a Prometheus scrape endpoint when `metrics.enabled` is set

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Lock metrics
    describe_counter!(
        "warden_lock_acquired_total",
        "Total number of distributed lock acquisitions"
    );
    describe_counter!(
        "warden_lock_released_total",
        "Total number of distributed locks fully released"
    );
    describe_counter!(
        "warden_lock_retry_total",
        "Total number of lock acquisition retries"
    );
    describe_counter!(
        "warden_lock_renewal_total",
        "Total number of lease renewal attempts by outcome"
    );

    // Rate limiter metrics
    describe_counter!(
        "warden_ratelimit_decisions_total",
        "Total number of rate limit decisions by limiter and outcome"
    );

    // Stock runner metrics
    describe_counter!(
        "warden_stock_deductions_total",
        "Total number of stock deduction attempts by outcome"
    );
    describe_histogram!(
        "warden_stock_deduction_duration_seconds",
        "Time spent holding the lock for one deduction"
    );

    tracing::info!("Metrics initialized");
}

/// Serve `/metrics` on `addr`; must run inside a tokio runtime
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install prometheus exporter: {}", e))?;
    tracing::info!(listen = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_stock_deduction(outcome: &'static str, duration_secs: f64) {
    counter!("warden_stock_deductions_total", "outcome" => outcome).increment(1);
    histogram!("warden_stock_deduction_duration_seconds").record(duration_secs);
}

/// Timer for measuring durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
