//! Graceful-degradation tracker.
//!
//! Central registry of subsystem health. Callers consult
//! `should_use_fallback` before expensive operations; state transitions
//! fire registered callbacks.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

/// The dependent subsystems tracked for degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Database,
    Scanner,
    Ipc,
    Cache,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Database => "database",
            Service::Scanner => "scanner",
            Service::Ipc => "ipc",
            Service::Cache => "cache",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Healthy,
    Degraded,
    Failed,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceHealth {
    pub state: ServiceState,
    pub consecutive_failures: u32,
    pub recovery_failures: u32,
    pub last_transition: Instant,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            state: ServiceState::Healthy,
            consecutive_failures: 0,
            recovery_failures: 0,
            last_transition: Instant::now(),
        }
    }
}

/// Consecutive operation failures before a service is marked Failed.
const FAILED_THRESHOLD: u32 = 3;
/// Consecutive recovery failures before a service is marked Critical.
const CRITICAL_THRESHOLD: u32 = 3;

type TransitionCallback = Box<dyn Fn(Service, ServiceState) + Send + Sync>;

#[derive(Default)]
pub struct DegradationTracker {
    services: DashMap<Service, ServiceHealth>,
    callbacks: RwLock<Vec<TransitionCallback>>,
}

impl DegradationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback fired on every state transition.
    pub fn on_transition<F>(&self, callback: F)
    where
        F: Fn(Service, ServiceState) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }

    pub fn report_success(&self, service: Service) {
        let changed = {
            let mut health = self.services.entry(service).or_default();
            health.consecutive_failures = 0;
            health.recovery_failures = 0;
            if health.state != ServiceState::Healthy {
                health.state = ServiceState::Healthy;
                health.last_transition = Instant::now();
                true
            } else {
                false
            }
        };
        if changed {
            info!(service = service.as_str(), "service recovered to healthy");
            self.fire(service, ServiceState::Healthy);
        }
    }

    pub fn report_failure(&self, service: Service) {
        let new_state = {
            let mut health = self.services.entry(service).or_default();
            if health.state == ServiceState::Critical {
                return;
            }
            health.consecutive_failures += 1;
            let next = if health.consecutive_failures >= FAILED_THRESHOLD {
                ServiceState::Failed
            } else {
                ServiceState::Degraded
            };
            if health.state != next {
                health.state = next;
                health.last_transition = Instant::now();
                Some(next)
            } else {
                None
            }
        };
        if let Some(state) = new_state {
            warn!(service = service.as_str(), state = ?state, "service degraded");
            self.fire(service, state);
        }
    }

    /// A recovery attempt for a failed service did not succeed. Three or
    /// more in a row mark the service Critical.
    pub fn report_recovery_failure(&self, service: Service) {
        let went_critical = {
            let mut health = self.services.entry(service).or_default();
            health.recovery_failures += 1;
            if health.recovery_failures >= CRITICAL_THRESHOLD
                && health.state != ServiceState::Critical
            {
                health.state = ServiceState::Critical;
                health.last_transition = Instant::now();
                true
            } else {
                false
            }
        };
        if went_critical {
            warn!(service = service.as_str(), "Security: service marked critical after repeated recovery failures");
            self.fire(service, ServiceState::Critical);
        }
    }

    /// True when callers should skip the service and take their fallback
    /// path. Degraded services are still worth trying.
    pub fn should_use_fallback(&self, service: Service) -> bool {
        matches!(
            self.state(service),
            ServiceState::Failed | ServiceState::Critical
        )
    }

    pub fn state(&self, service: Service) -> ServiceState {
        self.services
            .get(&service)
            .map(|h| h.state)
            .unwrap_or(ServiceState::Healthy)
    }

    pub fn health(&self, service: Service) -> ServiceHealth {
        self.services
            .get(&service)
            .map(|h| *h)
            .unwrap_or_default()
    }

    fn fire(&self, service: Service, state: ServiceState) {
        for callback in self.callbacks.read().iter() {
            callback(service, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn failures_walk_degraded_then_failed() {
        let tracker = DegradationTracker::new();
        assert_eq!(tracker.state(Service::Database), ServiceState::Healthy);
        tracker.report_failure(Service::Database);
        assert_eq!(tracker.state(Service::Database), ServiceState::Degraded);
        assert!(!tracker.should_use_fallback(Service::Database));
        tracker.report_failure(Service::Database);
        tracker.report_failure(Service::Database);
        assert_eq!(tracker.state(Service::Database), ServiceState::Failed);
        assert!(tracker.should_use_fallback(Service::Database));
    }

    #[test]
    fn success_restores_health() {
        let tracker = DegradationTracker::new();
        for _ in 0..3 {
            tracker.report_failure(Service::Scanner);
        }
        tracker.report_success(Service::Scanner);
        assert_eq!(tracker.state(Service::Scanner), ServiceState::Healthy);
        assert!(!tracker.should_use_fallback(Service::Scanner));
    }

    #[test]
    fn repeated_recovery_failures_go_critical() {
        let tracker = DegradationTracker::new();
        for _ in 0..3 {
            tracker.report_failure(Service::Ipc);
        }
        tracker.report_recovery_failure(Service::Ipc);
        tracker.report_recovery_failure(Service::Ipc);
        assert_eq!(tracker.state(Service::Ipc), ServiceState::Failed);
        tracker.report_recovery_failure(Service::Ipc);
        assert_eq!(tracker.state(Service::Ipc), ServiceState::Critical);
    }

    #[test]
    fn callbacks_fire_on_transitions() {
        let tracker = DegradationTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        tracker.on_transition(move |_, _| {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        tracker.report_failure(Service::Cache); // healthy -> degraded
        tracker.report_failure(Service::Cache); // still degraded, no fire
        tracker.report_failure(Service::Cache); // degraded -> failed
        tracker.report_success(Service::Cache); // failed -> healthy
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
