//! Quarantine Store
//! ================
//! Append-only, permission-hardened directory holding suspected-malicious
//! payloads. Every failure mode leaves either a complete entry, a cleanable
//! orphan marker, or no trace at all.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::entry::{QuarantineEntry, QuarantineFileInfo};
use super::id::{generate_id, is_valid_id};
use super::QuarantineError;
use crate::metrics::QUARANTINE_OPS_TOTAL;
use crate::retry::{retry_with_schedule, RetryPolicy};
use crate::validators::{self, MAX_POLICY_URL_LEN};

const DIR_MODE: u32 = 0o700;
const ENTRY_MODE: u32 = 0o400;
const RESTORED_MODE: u32 = 0o600;

/// Backoff schedule for payload cleanup after a metadata write failure.
const CLEANUP_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];

/// Filesystem-backed quarantine. Stateless between calls; all state lives
/// on disk so a crash at any point is recoverable at the next initialize.
pub struct QuarantineStore {
    root: PathBuf,
    retry: RetryPolicy,
}

impl QuarantineStore {
    /// `root` is the quarantine directory itself, conventionally
    /// `<user-data>/Ladybird/Quarantine`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            retry: RetryPolicy::default(),
        }
    }

    /// The conventional quarantine directory under a user-data root.
    pub fn default_root(user_data_dir: &Path) -> PathBuf {
        user_data_dir.join("Ladybird").join("Quarantine")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory (mode 0700) and sweep orphan markers left by a
    /// previous crash. Safe to call repeatedly.
    pub fn initialize(&self) -> Result<(), QuarantineError> {
        let root = self.root.clone();
        self.retry
            .execute("create quarantine directory", || fs::create_dir_all(&root))
            .map_err(|source| QuarantineError::from_io("creating the quarantine directory", source))?;
        self.retry
            .execute("harden quarantine directory", || {
                fs::set_permissions(&root, fs::Permissions::from_mode(DIR_MODE))
            })
            .map_err(|source| QuarantineError::from_io("hardening the quarantine directory", source))?;
        let recovered = self.recover_orphans();
        if recovered > 0 {
            info!(recovered, "quarantine orphan recovery complete");
        }
        Ok(())
    }

    /// Move `source` into quarantine. Returns the new entry id.
    pub fn quarantine_file(
        &self,
        source: &Path,
        info: &QuarantineFileInfo,
    ) -> Result<String, QuarantineError> {
        validators::check_url("original_url", &info.original_url, MAX_POLICY_URL_LEN)?;
        validators::check_filename(&info.filename)?;
        validators::check_sha256(&info.sha256)?;
        validators::check_size(info.file_size)?;
        validators::check_vec_len("rule_names", info.rule_names.len())?;

        let id = self.unused_id();
        let bin_path = self.bin_path(&id);
        let json_path = self.json_path(&id);

        fs::rename(source, &bin_path).map_err(|source| {
            QUARANTINE_OPS_TOTAL.with_label_values(&["quarantine", "failed"]).inc();
            QuarantineError::from_io("moving the payload into quarantine", source)
        })?;
        if let Err(err) = fs::set_permissions(&bin_path, fs::Permissions::from_mode(ENTRY_MODE)) {
            warn!(id, error = %err, "Security: could not harden quarantined payload permissions");
        }

        let entry = QuarantineEntry {
            quarantine_id: id.clone(),
            original_url: info.original_url.clone(),
            filename: info.filename.clone(),
            detection_time: Utc::now().to_rfc3339(),
            sha256: info.sha256.clone(),
            file_size: info.file_size,
            rule_names: info.rule_names.clone(),
        };
        match self.write_metadata(&json_path, &entry) {
            Ok(()) => {
                QUARANTINE_OPS_TOTAL.with_label_values(&["quarantine", "ok"]).inc();
                info!(id, url = %entry.original_url, "Security: payload quarantined");
                Ok(id)
            }
            Err(write_err) => {
                QUARANTINE_OPS_TOTAL.with_label_values(&["quarantine", "failed"]).inc();
                self.unwind_payload(&id, &bin_path, write_err)
            }
        }
    }

    /// Restore a quarantined payload into `destination_dir` with a
    /// sanitized filename and mode 0600. On failure the payload stays in
    /// quarantine.
    pub fn restore_file(
        &self,
        id: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, QuarantineError> {
        self.require_valid_id(id)?;
        let entry = self.read_metadata(id)?;
        let dest = self.validated_destination(destination_dir)?;
        let filename = sanitize_filename(&entry.filename)?;
        let target = self.collision_free_target(&dest, &filename)?;

        let bin_path = self.bin_path(id);
        fs::rename(&bin_path, &target).map_err(|source| {
            QUARANTINE_OPS_TOTAL.with_label_values(&["restore", "failed"]).inc();
            match source.raw_os_error() {
                Some(libc::ENOSPC) => QuarantineError::DiskFull {
                    path: dest.clone(),
                },
                Some(libc::EACCES) | Some(libc::EPERM) => QuarantineError::PermissionDenied {
                    path: dest.clone(),
                },
                _ => QuarantineError::from_io("restoring the payload", source),
            }
        })?;
        if let Err(err) = fs::set_permissions(&target, fs::Permissions::from_mode(RESTORED_MODE)) {
            warn!(id, error = %err, "could not set restored file permissions");
        }
        if let Err(err) = fs::remove_file(self.json_path(id)) {
            warn!(id, error = %err, "restored payload but metadata removal failed");
        }
        QUARANTINE_OPS_TOTAL.with_label_values(&["restore", "ok"]).inc();
        info!(id, target = %target.display(), "quarantined payload restored");
        Ok(target)
    }

    /// Remove both files of an entry. Either file missing is not an error,
    /// so the operation is idempotent.
    pub fn delete_file(&self, id: &str) -> Result<(), QuarantineError> {
        self.require_valid_id(id)?;
        for path in [self.bin_path(id), self.json_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    QUARANTINE_OPS_TOTAL.with_label_values(&["delete", "failed"]).inc();
                    return Err(QuarantineError::from_io("deleting a quarantine entry", source));
                }
            }
        }
        QUARANTINE_OPS_TOTAL.with_label_values(&["delete", "ok"]).inc();
        Ok(())
    }

    /// Read and parse the metadata for one entry.
    pub fn read_metadata(&self, id: &str) -> Result<QuarantineEntry, QuarantineError> {
        self.require_valid_id(id)?;
        let json_path = self.json_path(id);
        let raw = fs::read_to_string(&json_path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                QuarantineError::EntryNotFound { id: id.to_string() }
            } else {
                QuarantineError::from_io("reading quarantine metadata", source)
            }
        })?;
        serde_json::from_str(&raw).map_err(|err| QuarantineError::CorruptMetadata {
            id: id.to_string(),
            reason: err.to_string(),
        })
    }

    /// Enumerate every parseable entry, ordered by id (which is ordered by
    /// detection time). Unparseable metadata is skipped with a warning.
    pub fn list_entries(&self) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        let mut entries = Vec::new();
        let dir = fs::read_dir(&self.root)
            .map_err(|source| QuarantineError::from_io("listing the quarantine directory", source))?;
        for dirent in dir {
            let dirent =
                dirent.map_err(|source| QuarantineError::from_io("listing the quarantine directory", source))?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_id(id) {
                warn!(file = %path.display(), "Security: ignoring metadata file with malformed id");
                continue;
            }
            match self.read_metadata(id) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(id, error = %err, "skipping unreadable quarantine entry"),
            }
        }
        entries.sort_by(|a, b| a.quarantine_id.cmp(&b.quarantine_id));
        Ok(entries)
    }

    fn require_valid_id(&self, id: &str) -> Result<(), QuarantineError> {
        if !is_valid_id(id) {
            warn!(id, "Security: rejected malformed quarantine id");
            return Err(QuarantineError::MalformedId { id: id.to_string() });
        }
        Ok(())
    }

    fn unused_id(&self) -> String {
        // Collisions need the same second and the same 24 random bits; a
        // couple of regenerations covers it.
        for _ in 0..8 {
            let id = generate_id();
            if !self.bin_path(&id).exists() && !self.json_path(&id).exists() {
                return id;
            }
        }
        generate_id()
    }

    fn bin_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.bin"))
    }

    fn json_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn orphan_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.orphaned"))
    }

    fn write_metadata(&self, json_path: &Path, entry: &QuarantineEntry) -> io::Result<()> {
        let raw = serde_json::to_vec(entry).map_err(io::Error::other)?;
        fs::write(json_path, raw)?;
        if let Err(err) = fs::set_permissions(json_path, fs::Permissions::from_mode(ENTRY_MODE)) {
            warn!(path = %json_path.display(), error = %err, "could not harden metadata permissions");
        }
        Ok(())
    }

    /// Metadata write failed: remove the payload, or leave an orphan marker
    /// for the next initialize to sweep.
    fn unwind_payload(
        &self,
        id: &str,
        bin_path: &Path,
        write_err: io::Error,
    ) -> Result<String, QuarantineError> {
        let removed = retry_with_schedule("remove orphaned payload", &CLEANUP_DELAYS, || {
            match fs::remove_file(bin_path) {
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        });
        match removed {
            Ok(()) => Err(QuarantineError::MetadataWrite {
                id: id.to_string(),
                source: write_err,
            }),
            Err(cleanup_err) => {
                error!(id, error = %cleanup_err, "Security: payload cleanup failed, leaving orphan marker");
                if let Err(marker_err) = fs::write(self.orphan_path(id), Utc::now().to_rfc3339()) {
                    error!(id, error = %marker_err, "Security: could not write orphan marker");
                }
                Err(QuarantineError::OrphanedPayload { id: id.to_string() })
            }
        }
    }

    /// Sweep `*.orphaned` markers: retry the payload deletion, then the
    /// marker deletion. Failures are logged and the sweep continues.
    fn recover_orphans(&self) -> usize {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(error = %err, "could not scan quarantine directory for orphans");
                return 0;
            }
        };
        let mut recovered = 0;
        for dirent in dir.flatten() {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("orphaned") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let bin_path = self.bin_path(&id);
            let removed = retry_with_schedule("recover orphaned payload", &CLEANUP_DELAYS, || {
                match fs::remove_file(&bin_path) {
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            });
            match removed {
                Ok(()) => {
                    let marker_removed =
                        retry_with_schedule("remove orphan marker", &CLEANUP_DELAYS, || {
                            fs::remove_file(&path)
                        });
                    match marker_removed {
                        Ok(()) => {
                            debug!(id, "orphaned quarantine entry cleaned");
                            recovered += 1;
                        }
                        Err(err) => {
                            warn!(id, error = %err, "orphan payload removed but marker remains")
                        }
                    }
                }
                Err(err) => warn!(id, error = %err, "orphaned payload still not removable"),
            }
        }
        recovered
    }

    fn validated_destination(&self, destination: &Path) -> Result<PathBuf, QuarantineError> {
        let canonical = fs::canonicalize(destination).map_err(|err| {
            QuarantineError::DestinationInvalid {
                dest: destination.to_path_buf(),
                reason: format!("cannot resolve: {err}"),
            }
        })?;
        if !canonical.is_absolute() || !canonical.is_dir() {
            return Err(QuarantineError::DestinationInvalid {
                dest: destination.to_path_buf(),
                reason: "not an absolute existing directory".to_string(),
            });
        }
        if !is_writable_dir(&canonical) {
            return Err(QuarantineError::DestinationInvalid {
                dest: destination.to_path_buf(),
                reason: "directory is not writable".to_string(),
            });
        }
        Ok(canonical)
    }

    fn collision_free_target(
        &self,
        dest: &Path,
        filename: &str,
    ) -> Result<PathBuf, QuarantineError> {
        let first = dest.join(filename);
        if !first.exists() {
            return Ok(first);
        }
        let (stem, ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (filename, None),
        };
        for n in 1..=999u32 {
            let candidate = match ext {
                Some(ext) => dest.join(format!("{stem}_({n}).{ext}")),
                None => dest.join(format!("{stem}_({n})")),
            };
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(QuarantineError::CollisionOverflow {
            filename: filename.to_string(),
        })
    }
}

/// Strip path components (both separator conventions) and control bytes
/// from a stored filename; the renderer that supplied it is untrusted.
fn sanitize_filename(stored: &str) -> Result<String, QuarantineError> {
    let basename = stored
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let cleaned: String = basename.chars().filter(|c| *c as u32 >= 32).collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        warn!(stored, "Security: stored filename sanitized to nothing");
        return Err(QuarantineError::UnusableFilename {
            stored: stored.to_string(),
        });
    }
    Ok(cleaned)
}

fn is_writable_dir(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: cpath is a valid NUL-terminated string for the access(2) call.
    unsafe { libc::access(cpath.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!(sanitize_filename("../../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("..\\..\\boot.ini").unwrap(), "boot.ini");
        assert_eq!(sanitize_filename("plain.txt").unwrap(), "plain.txt");
        assert_eq!(sanitize_filename("with\x01control\x1f.txt").unwrap(), "withcontrol.txt");
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("dir/").is_err());
        assert!(sanitize_filename("\x02\x03").is_err());
    }
}
