//! Scan telemetry counters.
//!
//! Updated under a single mutex by the pipeline and the worker pool;
//! readers take a snapshot.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanTelemetry {
    pub total_scans: u64,
    pub scans_small: u64,
    pub scans_medium: u64,
    pub scans_large: u64,
    pub scans_oversized_skipped: u64,
    pub threats_detected: u64,
    pub engine_failures: u64,
    pub total_scans_timeout: u64,
    pub queue_rejections: u64,
    pub total_scan_duration_ms: u64,
}

impl ScanTelemetry {
    /// Mean wall-clock per completed scan, in milliseconds.
    pub fn average_scan_duration_ms(&self) -> f64 {
        if self.total_scans == 0 {
            0.0
        } else {
            self.total_scan_duration_ms as f64 / self.total_scans as f64
        }
    }
}
