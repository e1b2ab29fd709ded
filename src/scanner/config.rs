//! Size-tier configuration for the content scanner.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Which scanning strategy a payload's size selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTier {
    /// Whole payload in one request.
    Small,
    /// Streamed in overlapping chunks.
    Medium,
    /// First and last `large_scan_bytes` only.
    Large,
    /// Not scanned at all; counted in telemetry.
    Oversized,
}

impl ScanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanTier::Small => "small",
            ScanTier::Medium => "medium",
            ScanTier::Large => "large",
            ScanTier::Oversized => "oversized",
        }
    }
}

/// All thresholds are configuration, not constants. Validation runs once
/// at load; a config that fails validation is a programming bug and fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSizeConfig {
    pub small_file_threshold: u64,
    pub medium_file_threshold: u64,
    pub max_scan_size: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub large_scan_bytes: u64,
}

impl Default for ScanSizeConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: 10 * MIB,
            medium_file_threshold: 100 * MIB,
            max_scan_size: 200 * MIB,
            chunk_size: MIB as usize,
            chunk_overlap: 4096,
            large_scan_bytes: 10 * MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("size thresholds must be ordered small < medium < max ({small} / {medium} / {max})")]
    ThresholdOrder { small: u64, medium: u64, max: u64 },

    #[error("chunk overlap {overlap} must be smaller than chunk size {chunk}")]
    OverlapTooLarge { overlap: usize, chunk: usize },

    #[error("large-tier scan window {window} must not exceed the medium threshold {medium}")]
    LargeWindowTooBig { window: u64, medium: u64 },

    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
}

impl ScanSizeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Zero { field: "chunk_size" });
        }
        if self.small_file_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "small_file_threshold",
            });
        }
        if self.large_scan_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "large_scan_bytes",
            });
        }
        if !(self.small_file_threshold < self.medium_file_threshold
            && self.medium_file_threshold < self.max_scan_size)
        {
            return Err(ConfigError::ThresholdOrder {
                small: self.small_file_threshold,
                medium: self.medium_file_threshold,
                max: self.max_scan_size,
            });
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::OverlapTooLarge {
                overlap: self.chunk_overlap,
                chunk: self.chunk_size,
            });
        }
        if self.large_scan_bytes > self.medium_file_threshold {
            return Err(ConfigError::LargeWindowTooBig {
                window: self.large_scan_bytes,
                medium: self.medium_file_threshold,
            });
        }
        Ok(())
    }

    pub fn tier_for(&self, content_len: u64) -> ScanTier {
        if content_len <= self.small_file_threshold {
            ScanTier::Small
        } else if content_len <= self.medium_file_threshold {
            ScanTier::Medium
        } else if content_len <= self.max_scan_size {
            ScanTier::Large
        } else {
            ScanTier::Oversized
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ScanSizeConfig::default().validate().unwrap();
    }

    #[test]
    fn tier_boundaries_are_inclusive() {
        let cfg = ScanSizeConfig::default();
        assert_eq!(cfg.tier_for(0), ScanTier::Small);
        assert_eq!(cfg.tier_for(cfg.small_file_threshold), ScanTier::Small);
        assert_eq!(cfg.tier_for(cfg.small_file_threshold + 1), ScanTier::Medium);
        assert_eq!(cfg.tier_for(cfg.medium_file_threshold), ScanTier::Medium);
        assert_eq!(cfg.tier_for(cfg.medium_file_threshold + 1), ScanTier::Large);
        assert_eq!(cfg.tier_for(cfg.max_scan_size), ScanTier::Large);
        assert_eq!(cfg.tier_for(cfg.max_scan_size + 1), ScanTier::Oversized);
    }

    #[test]
    fn misordered_thresholds_are_rejected() {
        let mut cfg = ScanSizeConfig::default();
        cfg.medium_file_threshold = cfg.small_file_threshold;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut cfg = ScanSizeConfig::default();
        cfg.chunk_overlap = cfg.chunk_size;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OverlapTooLarge { .. })
        ));
    }

    #[test]
    fn large_window_bounded_by_medium_threshold() {
        let mut cfg = ScanSizeConfig::default();
        cfg.large_scan_bytes = cfg.medium_file_threshold + 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LargeWindowTooBig { .. })
        ));
    }
}
