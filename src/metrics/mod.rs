//! Prometheus metrics for the dispatch engine
//!
//! This module tracks:
//! - Dispatches by final outcome (sent, failed, rejected, stale)
//! - Per-recipient deliveries by outcome
//! - Write retries, stale-lease rejections and reaped broadcasts
//! - Dispatch duration
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all dispatch metrics
struct DispatchMetrics {
    dispatches: CounterVec,
    deliveries: CounterVec,
    retries: Counter,
    stale_leases: Counter,
    reaped: Counter,
    dispatch_duration: Histogram,
}

/// Global storage for dispatch metrics
static DISPATCH_METRICS: OnceLock<DispatchMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = herald::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = DispatchMetrics {
        dispatches: register_counter_vec!(
            "herald_dispatches_total",
            "Total dispatches by outcome",
            &["outcome"]
        )?,
        deliveries: register_counter_vec!(
            "herald_deliveries_total",
            "Total per-recipient deliveries by outcome",
            &["outcome"]
        )?,
        retries: register_counter!(
            "herald_delivery_retries_total",
            "Total notification write retries"
        )?,
        stale_leases: register_counter!(
            "herald_stale_leases_total",
            "Total finalize calls rejected with a stale lease"
        )?,
        reaped: register_counter!(
            "herald_reaped_broadcasts_total",
            "Total broadcasts failed by the lease reaper"
        )?,
        dispatch_duration: register_histogram!(
            "herald_dispatch_duration_seconds",
            "Time spent in one dispatch in seconds",
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
    };

    DISPATCH_METRICS
        .set(metrics)
        .map_err(|_| "Dispatch metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    DISPATCH_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record the outcome of one dispatch
pub fn record_dispatch(outcome: &str) {
    if let Some(m) = DISPATCH_METRICS.get() {
        m.dispatches.with_label_values(&[outcome]).inc();
    }
}

/// Record per-recipient delivery counts
pub fn record_deliveries(delivered: usize, already_delivered: usize, failed: usize) {
    let Some(m) = DISPATCH_METRICS.get() else {
        return;
    };

    for (outcome, count) in [
        ("delivered", delivered),
        ("already_delivered", already_delivered),
        ("failed", failed),
    ] {
        if count > 0 {
            m.deliveries
                .with_label_values(&[outcome])
                .inc_by(count as f64);
        }
    }
}

/// Record a write retry
pub fn record_retry() {
    if let Some(m) = DISPATCH_METRICS.get() {
        m.retries.inc();
    }
}

/// Record a finalize rejected for a stale lease
pub fn record_stale_lease() {
    if let Some(m) = DISPATCH_METRICS.get() {
        m.stale_leases.inc();
    }
}

/// Record broadcasts failed by the reaper
pub fn record_reaped(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = DISPATCH_METRICS.get() {
        m.reaped.inc_by(count as f64);
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a dispatch timer (returns a timer handle)
pub fn start_dispatch_timer() -> MetricsTimer {
    match DISPATCH_METRICS.get() {
        Some(m) => MetricsTimer::new(m.dispatch_duration.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
