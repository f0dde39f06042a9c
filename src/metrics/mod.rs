//! Prometheus metrics for fleetdist nodes
//!
//! This module provides metrics tracking for:
//! - Membership: known nodes, added/removed events, listener batches and evictions
//! - Supervision: executor/work resets by reason, failed restarts
//! - Sessions: leases granted after a loss, leases lost
//! - Status API: requests and their duration
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, or it is never called, metrics operations are no-ops.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for distribution metrics
struct DistributionMetrics {
    nodes: GaugeVec,
    membership_events: CounterVec,
    listener_batches: CounterVec,
    listener_evictions: CounterVec,
    supervisor_resets: CounterVec,
    supervisor_restart_errors: CounterVec,
    sessions_created: CounterVec,
    sessions_lost: CounterVec,
}

/// Container for status API metrics
struct ApiMetrics {
    requests: CounterVec,
    duration: HistogramVec,
}

static DISTRIBUTION_METRICS: OnceLock<DistributionMetrics> = OnceLock::new();

static API_METRICS: OnceLock<ApiMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// Subsequent calls return `Ok(())` without registering anything.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = fleetdist::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let distribution = DistributionMetrics {
        nodes: register_gauge_vec!(
            "fleetdist_nodes",
            "Number of nodes known to the node's assigner",
            &["node"]
        )?,
        membership_events: register_counter_vec!(
            "fleetdist_membership_events_total",
            "Membership changes observed by the node",
            &["node", "type"]
        )?,
        listener_batches: register_counter_vec!(
            "fleetdist_listener_batches_total",
            "Event batches flushed to listeners",
            &["node"]
        )?,
        listener_evictions: register_counter_vec!(
            "fleetdist_listener_evictions_total",
            "Listeners evicted because their queue was full",
            &["node"]
        )?,
        supervisor_resets: register_counter_vec!(
            "fleetdist_supervisor_resets_total",
            "Executor and work resets by reason",
            &["node", "name", "reason"]
        )?,
        supervisor_restart_errors: register_counter_vec!(
            "fleetdist_supervisor_restart_errors_total",
            "Executor and work resets that failed to start a new run",
            &["node", "name"]
        )?,
        sessions_created: register_counter_vec!(
            "fleetdist_sessions_created_total",
            "Leases granted to replace a lost one",
            &["node"]
        )?,
        sessions_lost: register_counter_vec!(
            "fleetdist_sessions_lost_total",
            "Leases lost through expiry or revocation",
            &["node"]
        )?,
    };

    let api = ApiMetrics {
        requests: register_counter_vec!(
            "fleetdist_api_requests_total",
            "Total status API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        duration: register_histogram_vec!(
            "fleetdist_api_request_duration_seconds",
            "Status API request duration in seconds",
            &["endpoint"],
            vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
        )?,
    };

    DISTRIBUTION_METRICS
        .set(distribution)
        .map_err(|_| "Distribution metrics already initialized")?;
    API_METRICS
        .set(api)
        .map_err(|_| "API metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    DISTRIBUTION_METRICS.get().is_some() && API_METRICS.get().is_some()
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

/// Set the number of nodes in the node's ring
pub fn set_known_nodes(node: &str, count: usize) {
    if let Some(m) = DISTRIBUTION_METRICS.get() {
        m.nodes.with_label_values(&[node]).set(count as f64);
    }
}

/// Record membership changes, `kind` is `added` or `removed`
pub fn record_membership_events(node: &str, kind: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = DISTRIBUTION_METRICS.get() {
        m.membership_events
            .with_label_values(&[node, kind])
            .inc_by(count as f64);
    }
}

/// Record a flushed listener batch
pub fn record_listener_batch(node: &str) {
    if let Some(m) = DISTRIBUTION_METRICS.get() {
        m.listener_batches.with_label_values(&[node]).inc();
    }
}

/// Record an evicted listener
pub fn record_listener_eviction(node: &str) {
    if let Some(m) = DISTRIBUTION_METRICS.get() {
        m.listener_evictions.with_label_values(&[node]).inc();
    }
}

/// Record a supervisor reset
pub fn record_supervisor_reset(node: &str, name: &str, reason: &str) {
    if let Some(m) = DISTRIBUTION_METRICS.get() {
        m.supervisor_resets
            .with_label_values(&[node, name, reason])
            .inc();
    }
}

/// Record a reset that could not start a new run
pub fn record_supervisor_restart_error(node: &str, name: &str) {
    if let Some(m) = DISTRIBUTION_METRICS.get() {
        m.supervisor_restart_errors
            .with_label_values(&[node, name])
            .inc();
    }
}

/// Record a session event
pub fn record_session_event(node: &str, lost: bool) {
    let Some(m) = DISTRIBUTION_METRICS.get() else {
        return;
    };

    if lost {
        m.sessions_lost.with_label_values(&[node]).inc();
    } else {
        m.sessions_created.with_label_values(&[node]).inc();
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = API_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        // Idempotent
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_initialized() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        set_known_nodes("node1", 3);
        let text = encode_metrics().unwrap();
        assert!(text.contains("fleetdist_nodes"));
    }

    #[test]
    fn test_distribution_metrics() {
        ensure_metrics_initialized();
        record_membership_events("node1", "added", 2);
        record_membership_events("node1", "removed", 0);
        record_listener_batch("node1");
        record_listener_eviction("node1");
        record_supervisor_reset("node1", "tasks", "periodical");
        record_supervisor_restart_error("node1", "tasks");
        record_session_event("node1", true);
        record_session_event("node1", false);
        record_api_request("/api/health", 200, 0.001);
    }
}
