//! SecurityTap
//! ===========
//! Size-tiered content scanner backed by the external signature engine.
//! Synchronous inspection fails open on every infrastructure failure; the
//! asynchronous path queues onto the worker pool.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{ScanSizeConfig, ScanTier};
use super::engine::{EngineClient, EngineError, EngineVerdict};
use super::telemetry::ScanTelemetry;
use super::worker_pool::{ScanCallback, ScanRequest, WorkerPool};
use super::{DownloadMetadata, ScanError, ScanResult};
use crate::metrics::{SCANS_TOTAL, SCAN_DURATION_SECONDS};
use crate::runtime::TaskRemote;
use crate::validators::{self, MAX_URL_LEN};

/// The scanning state shared between the tap and its workers: tier
/// configuration, the engine connection, and the telemetry counters.
pub struct ScanPipeline {
    config: RwLock<ScanSizeConfig>,
    engine: Mutex<EngineClient>,
    telemetry: Mutex<ScanTelemetry>,
}

impl ScanPipeline {
    pub(crate) fn new(engine_socket: PathBuf, config: ScanSizeConfig) -> Self {
        Self {
            config: RwLock::new(config),
            engine: Mutex::new(EngineClient::new(engine_socket)),
            telemetry: Mutex::new(ScanTelemetry::default()),
        }
    }

    /// Synchronous scan. Never panics; engine-level failures are logged
    /// and reported as non-threat.
    pub(crate) fn inspect(
        &self,
        meta: &DownloadMetadata,
        content: &[u8],
    ) -> Result<ScanResult, ScanError> {
        validators::check_url("url", &meta.url, MAX_URL_LEN)?;
        validators::check_filename(&meta.filename)?;
        validators::check_string("mime_type", &meta.mime_type)?;
        validators::check_sha256(&meta.sha256)?;
        validators::check_size(meta.size)?;

        let config = *self.config.read();
        let tier = config.tier_for(content.len() as u64);
        if tier == ScanTier::Oversized {
            debug!(
                url = %meta.url,
                len = content.len(),
                "content exceeds the maximum scan size, skipping"
            );
            self.telemetry.lock().scans_oversized_skipped += 1;
            SCANS_TOTAL
                .with_label_values(&[tier.as_str(), "skipped"])
                .inc();
            return Ok(ScanResult::clean());
        }

        let started = Instant::now();
        let outcome = match tier {
            ScanTier::Small => self.scan_whole(content),
            ScanTier::Medium => self.scan_chunked(content, &config),
            ScanTier::Large => self.scan_head_tail(content, &config),
            ScanTier::Oversized => unreachable!("handled above"),
        };
        let elapsed = started.elapsed();
        SCAN_DURATION_SECONDS.observe(elapsed.as_secs_f64());

        {
            let mut telemetry = self.telemetry.lock();
            telemetry.total_scans += 1;
            telemetry.total_scan_duration_ms += elapsed.as_millis() as u64;
            match tier {
                ScanTier::Small => telemetry.scans_small += 1,
                ScanTier::Medium => telemetry.scans_medium += 1,
                ScanTier::Large => telemetry.scans_large += 1,
                ScanTier::Oversized => {}
            }
            match &outcome {
                Ok(result) if result.is_threat => telemetry.threats_detected += 1,
                Ok(_) => {}
                Err(_) => telemetry.engine_failures += 1,
            }
        }

        match outcome {
            Ok(result) => {
                let label = if result.is_threat { "threat" } else { "clean" };
                SCANS_TOTAL.with_label_values(&[tier.as_str(), label]).inc();
                Ok(result)
            }
            Err(err) => {
                // Fail open: scanning availability never blocks a download.
                warn!(url = %meta.url, error = %err, "Security: signature engine failure, failing open");
                SCANS_TOTAL
                    .with_label_values(&[tier.as_str(), "failed"])
                    .inc();
                Ok(ScanResult::clean())
            }
        }
    }

    fn scan_whole(&self, content: &[u8]) -> Result<ScanResult, EngineError> {
        Ok(self.engine_request(content)?.into())
    }

    /// Stream in `chunk_size` windows overlapping by `chunk_overlap`. A
    /// threat in any chunk short-circuits the rest.
    fn scan_chunked(
        &self,
        content: &[u8],
        config: &ScanSizeConfig,
    ) -> Result<ScanResult, EngineError> {
        let step = config.chunk_size - config.chunk_overlap;
        let mut start = 0usize;
        loop {
            let end = (start + config.chunk_size).min(content.len());
            if let EngineVerdict::Threat(alert) = self.engine_request(&content[start..end])? {
                return Ok(ScanResult::threat(alert));
            }
            if end == content.len() {
                return Ok(ScanResult::clean());
            }
            start += step;
        }
    }

    /// Large tier: scan only the first and last `large_scan_bytes`.
    fn scan_head_tail(
        &self,
        content: &[u8],
        config: &ScanSizeConfig,
    ) -> Result<ScanResult, EngineError> {
        let window = config.large_scan_bytes as usize;
        if let EngineVerdict::Threat(alert) = self.engine_request(&content[..window])? {
            return Ok(ScanResult::threat(alert));
        }
        if let EngineVerdict::Threat(alert) =
            self.engine_request(&content[content.len() - window..])?
        {
            return Ok(ScanResult::threat(alert));
        }
        Ok(ScanResult::clean())
    }

    fn engine_request(&self, chunk: &[u8]) -> Result<EngineVerdict, EngineError> {
        let request_id = Uuid::new_v4().to_string();
        self.engine.lock().scan(&request_id, chunk)
    }

    pub(crate) fn note_timeout(&self) {
        self.telemetry.lock().total_scans_timeout += 1;
    }

    pub(crate) fn note_queue_rejection(&self) {
        self.telemetry.lock().queue_rejections += 1;
    }

    pub(crate) fn telemetry_snapshot(&self) -> ScanTelemetry {
        self.telemetry.lock().clone()
    }

    pub(crate) fn set_config(&self, config: ScanSizeConfig) {
        *self.config.write() = config;
    }

    pub(crate) fn reconnect(&self) -> Result<(), EngineError> {
        self.engine.lock().reconnect()
    }
}

impl From<EngineVerdict> for ScanResult {
    fn from(verdict: EngineVerdict) -> Self {
        match verdict {
            EngineVerdict::Clean => ScanResult::clean(),
            EngineVerdict::Threat(alert) => ScanResult::threat(alert),
        }
    }
}

/// The renderer-facing content scanner. Owns the worker pool; the pool
/// owns its threads and the queue.
pub struct SecurityTap {
    pipeline: Arc<ScanPipeline>,
    pool: WorkerPool,
}

impl SecurityTap {
    /// An invalid size configuration is a programming bug and fatal.
    pub fn new(
        engine_socket: PathBuf,
        config: ScanSizeConfig,
        worker_count: usize,
        remote: TaskRemote,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let pipeline = Arc::new(ScanPipeline::new(engine_socket, config));
        let pool = WorkerPool::start(Arc::clone(&pipeline), remote, worker_count);
        Ok(Self { pipeline, pool })
    }

    /// Blocking scan on the caller's thread.
    pub fn inspect(
        &self,
        meta: &DownloadMetadata,
        content: &[u8],
    ) -> Result<ScanResult, ScanError> {
        self.pipeline.inspect(meta, content)
    }

    /// Queue a scan; `callback` runs exactly once on the event-loop thread.
    /// `Err(QueueFull)` means nothing was queued and the caller fails open.
    pub fn inspect_async(
        &self,
        meta: DownloadMetadata,
        content: Vec<u8>,
        callback: ScanCallback,
    ) -> Result<(), ScanError> {
        let request = ScanRequest::new(meta, content, callback);
        match self.pool.enqueue(request) {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, ScanError::QueueFull) {
                    self.pipeline.note_queue_rejection();
                    warn!("scan queue full, caller fails open");
                }
                Err(err)
            }
        }
    }

    /// Replace the tier thresholds. The new configuration is validated the
    /// same way as at load.
    pub fn set_config(&self, config: ScanSizeConfig) -> Result<(), ScanError> {
        config.validate()?;
        self.pipeline.set_config(config);
        Ok(())
    }

    pub fn telemetry(&self) -> ScanTelemetry {
        self.pipeline.telemetry_snapshot()
    }

    /// Drop and re-dial the engine connection.
    pub fn reconnect(&self) -> Result<(), ScanError> {
        self.pipeline.reconnect()?;
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.pool.queue_len()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Cooperative, idempotent shutdown of the worker pool.
    pub fn stop(&mut self) {
        self.pool.stop();
    }
}
