//! Policy Module
//! =============
//! Policy and threat-history persistence, decision caching, and the
//! protective machinery around the database connection.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.

use thiserror::Error;

use crate::validators::ValidationError;

pub mod circuit_breaker;
pub mod decision_cache;
pub mod degradation;
pub mod graph;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use decision_cache::{CacheStats, DecisionCache, DecisionKey, DEFAULT_CACHE_CAPACITY};
pub use degradation::{DegradationTracker, Service, ServiceHealth, ServiceState};
pub use graph::{
    NewPolicy, Policy, PolicyAction, PolicyGraph, ThreatDecision, ThreatMetadata, ThreatRecord,
};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("the policy store circuit breaker is open; calls are rejected")]
    CircuitOpen,

    #[error("policy database error: {0}")]
    Database(#[from] rusqlite::Error),
}
