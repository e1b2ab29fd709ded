//! Quarantine Module
//! =================
//! Crash-safe filesystem store for suspected-malicious payloads.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::validators::ValidationError;

pub mod entry;
pub mod id;
pub mod store;

pub use entry::{QuarantineEntry, QuarantineFileInfo};
pub use id::{generate_id, is_valid_id};
pub use store::QuarantineStore;

/// Errors surfaced by the quarantine store. Messages are user-facing; the
/// restore path distinguishes disk-space and permission failures.
#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("quarantine id {id:?} does not match the required format")]
    MalformedId { id: String },

    #[error("no quarantine entry exists with id {id}")]
    EntryNotFound { id: String },

    #[error("metadata for quarantine entry {id} is corrupt: {reason}")]
    CorruptMetadata { id: String, reason: String },

    #[error("could not write quarantine metadata for {id}; the payload was removed")]
    MetadataWrite { id: String, source: io::Error },

    #[error("quarantine entry {id} was orphaned: metadata could not be written and the payload could not be removed; it will be cleaned up automatically")]
    OrphanedPayload { id: String },

    #[error("restore destination {dest} is unusable: {reason}")]
    DestinationInvalid { dest: PathBuf, reason: String },

    #[error("the stored filename {stored:?} contains no usable name")]
    UnusableFilename { stored: String },

    #[error("not enough disk space to restore the file to {path}")]
    DiskFull { path: PathBuf },

    #[error("permission denied while restoring the file to {path}")]
    PermissionDenied { path: PathBuf },

    #[error("could not find a collision-free name for {filename:?} after 999 attempts")]
    CollisionOverflow { filename: String },

    #[error("quarantine I/O failure while {context}: {source}")]
    Io {
        context: &'static str,
        source: io::Error,
    },
}

impl QuarantineError {
    pub(crate) fn from_io(context: &'static str, source: io::Error) -> Self {
        QuarantineError::Io { context, source }
    }
}
