//! Traffic Analysis Module
//! =======================
//! Per-domain behavioural monitoring and threat classification.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.

use thiserror::Error;

use crate::validators::ValidationError;

pub mod detectors;
pub mod monitor;

pub use detectors::{BeaconAnalyzer, DomainAnalyzer, ExfilAnalyzer};
pub use monitor::{
    ConnectionPattern, TrafficAlert, TrafficAlertType, TrafficMonitor, ALERT_THRESHOLD,
    ANALYSIS_INTERVAL_SECS, MAX_ALERTS, MAX_PATTERNS, MIN_REQUESTS_FOR_ANALYSIS,
};

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("empty domain")]
    EmptyDomain,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("{detector} detector failed to initialise: {reason}")]
    DetectorInit {
        detector: &'static str,
        reason: String,
    },
}
