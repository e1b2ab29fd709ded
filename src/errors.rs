//! Top-level error type. Subsystem errors convert into it on propagation;
//! errors always flow as values along return paths.

use thiserror::Error;

use crate::policy::PolicyError;
use crate::quarantine::QuarantineError;
use crate::scanner::ScanError;
use crate::traffic::TrafficError;
use crate::validators::ValidationError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Quarantine(#[from] QuarantineError),

    #[error(transparent)]
    Traffic(#[from] TrafficError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}
