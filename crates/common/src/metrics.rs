//! Metrics collection for WorkerBridge
//!
//! This module provides Prometheus metrics for the worker pool and the
//! request tracker. Updates are plain atomic operations so they can be
//! recorded while the component locks are held.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for WorkerBridge
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub pool: PoolMetrics,
    pub requests: RequestMetrics,
}

/// Worker pool metrics
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Currently registered workers
    pub registered_workers: IntGauge,

    /// Workers currently holding a request
    pub busy_workers: IntGauge,

    /// Registrations refused (pool full, duplicate id, bad token)
    pub registrations_rejected: IntCounter,

    /// Workers removed by the health sweep
    pub workers_evicted: IntCounter,

    /// Successful worker selections
    pub selections: IntCounter,

    /// Requests rejected because no worker was idle
    pub no_workers_available: IntCounter,

    /// Per-request processing time reported when a worker goes idle
    pub processing_time: Histogram,
}

/// Request tracker metrics
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Requests accepted for tracking
    pub accepted: IntCounter,

    /// Requests completed normally
    pub completed: IntCounter,

    /// Requests cancelled by the caller
    pub cancelled: IntCounter,

    /// Requests evicted by the timeout sweep
    pub timed_out: IntCounter,

    /// Requests failed by worker errors or disconnects
    pub failed: IntCounter,

    /// Result events that could not be delivered
    pub delivery_failures: IntCounter,

    /// Currently tracked requests
    pub active: IntGauge,

    /// Time from tracking to removal
    pub duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str, registry: &Registry) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(name: &str, help: &str, registry: &Registry) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>, registry: &Registry) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());
        let latency_buckets = vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

        let pool = PoolMetrics {
            registered_workers: gauge(
                "bridge_registered_workers",
                "Current number of registered workers",
                &registry,
            ),
            busy_workers: gauge(
                "bridge_busy_workers",
                "Current number of busy workers",
                &registry,
            ),
            registrations_rejected: counter(
                "bridge_worker_registrations_rejected_total",
                "Total worker registrations refused",
                &registry,
            ),
            workers_evicted: counter(
                "bridge_workers_evicted_total",
                "Total workers removed by the health sweep",
                &registry,
            ),
            selections: counter(
                "bridge_worker_selections_total",
                "Total successful worker selections",
                &registry,
            ),
            no_workers_available: counter(
                "bridge_no_workers_available_total",
                "Total requests rejected due to no idle worker",
                &registry,
            ),
            processing_time: histogram(
                "bridge_worker_processing_seconds",
                "Worker processing time per request",
                latency_buckets.clone(),
                &registry,
            ),
        };

        let requests = RequestMetrics {
            accepted: counter(
                "bridge_requests_accepted_total",
                "Total requests accepted for tracking",
                &registry,
            ),
            completed: counter(
                "bridge_requests_completed_total",
                "Total requests completed",
                &registry,
            ),
            cancelled: counter(
                "bridge_requests_cancelled_total",
                "Total requests cancelled",
                &registry,
            ),
            timed_out: counter(
                "bridge_requests_timed_out_total",
                "Total requests evicted after their timeout",
                &registry,
            ),
            failed: counter(
                "bridge_requests_failed_total",
                "Total requests failed by worker errors",
                &registry,
            ),
            delivery_failures: counter(
                "bridge_result_delivery_failures_total",
                "Total result events that could not be delivered",
                &registry,
            ),
            active: gauge(
                "bridge_active_requests",
                "Current number of tracked requests",
                &registry,
            ),
            duration: histogram(
                "bridge_request_duration_seconds",
                "Time between tracking and removal",
                latency_buckets,
                &registry,
            ),
        };

        MetricsRegistry {
            registry,
            pool,
            requests,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.requests.accepted.inc();
        metrics.requests.active.inc();
        metrics.pool.registered_workers.set(3);

        let output = metrics.gather();
        assert!(output.contains("bridge_requests_accepted_total 1"));
        assert!(output.contains("bridge_registered_workers 3"));
    }

    #[test]
    fn test_histogram_observation() {
        let metrics = MetricsRegistry::new();
        metrics.pool.processing_time.observe(2.5);

        assert_eq!(metrics.pool.processing_time.get_sample_count(), 1);
        assert!(metrics.gather().contains("bridge_worker_processing_seconds_bucket"));
    }
}
