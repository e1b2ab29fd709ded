//! Scanner Module
//! ==============
//! SecurityTap content inspection: size-tier dispatch, the external
//! signature-engine protocol, and the asynchronous worker pool.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validators::ValidationError;

pub mod config;
pub mod engine;
pub mod security_tap;
pub mod telemetry;
pub mod worker_pool;

pub use config::{ConfigError, ScanSizeConfig, ScanTier};
pub use engine::{EngineClient, EngineError, EngineVerdict};
pub use security_tap::SecurityTap;
pub use telemetry::ScanTelemetry;
pub use worker_pool::{
    ScanCallback, ScanRequest, WorkerPool, MAX_SCAN_TIMEOUT, MAX_WORKERS, MIN_WORKERS,
    QUEUE_CAPACITY,
};

/// Content descriptor assembled at entry. Every string is renderer-
/// supplied and untrusted; the digest is hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub url: String,
    pub filename: String,
    pub mime_type: String,
    pub sha256: String,
    pub size: u64,
}

/// Scan outcome. The alert is the engine's opaque JSON, round-tripped
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub is_threat: bool,
    pub alert: Option<String>,
}

impl ScanResult {
    pub fn clean() -> Self {
        Self {
            is_threat: false,
            alert: None,
        }
    }

    pub fn threat(alert: String) -> Self {
        Self {
            is_threat: true,
            alert: Some(alert),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("scan queue is full")]
    QueueFull,

    #[error("scan request spent {queued_for:?} in queue, past the dispatch deadline")]
    Timeout { queued_for: Duration },

    #[error("the scanner is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Engine(#[from] EngineError),
}
