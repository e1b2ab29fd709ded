//! Quarantine entry metadata as persisted in `<id>.json`.

use serde::{Deserialize, Serialize};

/// The metadata record written next to every quarantined payload. The key
/// set is fixed; unknown keys fail the parse so a tampered file is noticed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuarantineEntry {
    pub quarantine_id: String,
    pub original_url: String,
    pub filename: String,
    pub detection_time: String,
    pub sha256: String,
    pub file_size: u64,
    #[serde(default)]
    pub rule_names: Vec<String>,
}

/// Caller-supplied description of the file being quarantined. The store
/// fills in the id and detection time.
#[derive(Debug, Clone)]
pub struct QuarantineFileInfo {
    pub original_url: String,
    pub filename: String,
    pub sha256: String,
    pub file_size: u64,
    pub rule_names: Vec<String>,
}
