//! NetSentry Library
//! =================
//! Content-inspection and policy-enforcement core for the browser's
//! privileged network service.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

// Re-export main modules
pub mod core;
pub mod errors;
pub mod metrics;
pub mod policy;
pub mod quarantine;
pub mod retry;
pub mod runtime;
pub mod scanner;
pub mod traffic;
pub mod validators;

// Re-export key types for external use
pub use crate::core::{Core, CoreConfig, DownloadVerdict};
pub use crate::errors::CoreError;
pub use crate::scanner::{DownloadMetadata, ScanResult, SecurityTap};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the NetSentry library
pub fn init() {
    tracing::info!("NetSentry library v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_init() {
        init();
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
