//! Prometheus metrics for the content-inspection core
//!
//! This module provides metrics collection for:
//! - Scan throughput and latency per size tier
//! - Quarantine store operations
//! - Traffic alerts and policy decisions
//! - System performance

use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, TextEncoder};

// Global metrics registry
lazy_static! {
    pub static ref METRICS_REGISTRY: prometheus::Registry = {
        let registry = prometheus::Registry::new();

        registry.register(Box::new(SCANS_TOTAL.clone())).unwrap();
        registry.register(Box::new(SCAN_DURATION_SECONDS.clone())).unwrap();
        registry.register(Box::new(SCAN_QUEUE_DEPTH.clone())).unwrap();
        registry.register(Box::new(QUARANTINE_OPS_TOTAL.clone())).unwrap();
        registry.register(Box::new(TRAFFIC_ALERTS_TOTAL.clone())).unwrap();
        registry.register(Box::new(POLICY_DECISIONS_TOTAL.clone())).unwrap();
        registry.register(Box::new(CIRCUIT_BREAKER_STATE.clone())).unwrap();
        registry.register(Box::new(SYSTEM_MEMORY_USAGE_BYTES.clone())).unwrap();
        registry.register(Box::new(SYSTEM_CPU_USAGE_PERCENT.clone())).unwrap();

        registry
    };

    // Scanner metrics
    pub static ref SCANS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netsentry_scans_total", "Content scans by size tier and outcome"),
        &["tier", "outcome"]
    ).unwrap();

    pub static ref SCAN_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("netsentry_scan_duration_seconds", "Wall-clock time per content scan")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0])
    ).unwrap();

    pub static ref SCAN_QUEUE_DEPTH: Gauge = Gauge::new(
        "netsentry_scan_queue_depth",
        "Requests currently waiting in the scan queue"
    ).unwrap();

    // Quarantine metrics
    pub static ref QUARANTINE_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netsentry_quarantine_operations_total", "Quarantine store operations by result"),
        &["operation", "result"]
    ).unwrap();

    // Traffic monitor metrics
    pub static ref TRAFFIC_ALERTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netsentry_traffic_alerts_total", "Behavioural traffic alerts by type"),
        &["alert_type"]
    ).unwrap();

    // Policy metrics
    pub static ref POLICY_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netsentry_policy_decisions_total", "Policy decisions by action and source"),
        &["action", "source"]
    ).unwrap();

    pub static ref CIRCUIT_BREAKER_STATE: Gauge = Gauge::new(
        "netsentry_circuit_breaker_state",
        "Policy store circuit breaker state (0 closed, 1 half-open, 2 open)"
    ).unwrap();

    // System metrics
    pub static ref SYSTEM_MEMORY_USAGE_BYTES: Gauge = Gauge::new(
        "netsentry_system_memory_usage_bytes",
        "Current memory usage in bytes"
    ).unwrap();

    pub static ref SYSTEM_CPU_USAGE_PERCENT: Gauge = Gauge::new(
        "netsentry_system_cpu_usage_percent",
        "Current CPU usage percentage"
    ).unwrap();
}

/// Metrics server for exposing Prometheus metrics
pub struct MetricsServer {
    encoder: TextEncoder,
}

impl MetricsServer {
    pub fn new() -> Self {
        Self {
            encoder: TextEncoder::new(),
        }
    }

    /// Generate metrics output in Prometheus format
    pub fn encode_metrics(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let mut buffer = Vec::new();
        self.encoder
            .encode(&METRICS_REGISTRY.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize metrics with default values
pub fn init_metrics() {
    SCAN_QUEUE_DEPTH.set(0.0);
    CIRCUIT_BREAKER_STATE.set(0.0);
}

/// Update system metrics
pub fn update_system_metrics() {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_all();

    SYSTEM_MEMORY_USAGE_BYTES.set(sys.used_memory() as f64);
    SYSTEM_CPU_USAGE_PERCENT.set(sys.global_cpu_info().cpu_usage() as f64);
}
