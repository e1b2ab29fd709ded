//! Core Service Handle
//! ===================
//! Wires the four subsystems together and exposes the renderer-facing
//! surface: download handling and per-request traffic observation. One
//! `Core` is constructed at startup and borrowed by every consumer; there
//! are no ambient singletons.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::CoreError;
use crate::policy::{
    CircuitBreakerConfig, DegradationTracker, Policy, PolicyAction, PolicyError, PolicyGraph,
    Service, ThreatDecision, ThreatMetadata, DEFAULT_CACHE_CAPACITY,
};
use crate::quarantine::{QuarantineFileInfo, QuarantineStore};
use crate::runtime::TaskRemote;
use crate::scanner::{DownloadMetadata, ScanResult, ScanSizeConfig, SecurityTap};
use crate::traffic::{TrafficAlert, TrafficMonitor};

/// Placeholder digest for threat-history rows that have no payload, such
/// as traffic alerts.
const NO_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub user_data_dir: PathBuf,
    pub engine_socket: PathBuf,
    pub scan_sizes: ScanSizeConfig,
    pub scan_workers: usize,
    /// `None` puts the database next to the quarantine directory.
    pub policy_db: Option<PathBuf>,
    pub decision_cache_capacity: usize,
    pub breaker: CircuitBreakerConfig,
}

impl CoreConfig {
    pub fn new(user_data_dir: PathBuf) -> Self {
        let engine_socket = user_data_dir.join("Ladybird").join("signature-engine.sock");
        Self {
            user_data_dir,
            engine_socket,
            scan_sizes: ScanSizeConfig::default(),
            scan_workers: 4,
            policy_db: None,
            decision_cache_capacity: DEFAULT_CACHE_CAPACITY,
            breaker: CircuitBreakerConfig::default(),
        }
    }

    /// Locate the platform user-data directory. The only environment the
    /// core consults.
    pub fn discover() -> Option<Self> {
        dirs::data_dir().map(Self::new)
    }

    fn policy_db_path(&self) -> PathBuf {
        self.policy_db.clone().unwrap_or_else(|| {
            self.user_data_dir.join("Ladybird").join("policy_graph.db")
        })
    }
}

/// What happened to one download, and why.
#[derive(Debug)]
pub struct DownloadVerdict {
    pub decision: ThreatDecision,
    pub scan: Option<ScanResult>,
    pub matched_policy: Option<Policy>,
    pub quarantine_id: Option<String>,
}

pub struct Core {
    scanner: SecurityTap,
    quarantine: QuarantineStore,
    traffic: TrafficMonitor,
    policy: PolicyGraph,
    degradation: Arc<DegradationTracker>,
}

impl Core {
    pub fn new(config: CoreConfig, remote: TaskRemote) -> Result<Self, CoreError> {
        let quarantine =
            QuarantineStore::new(QuarantineStore::default_root(&config.user_data_dir));
        quarantine.initialize()?;

        let db_path = config.policy_db_path();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let policy = PolicyGraph::open(
            &db_path,
            config.decision_cache_capacity,
            config.breaker.clone(),
        )
        .map_err(CoreError::Policy)?;

        let scanner = SecurityTap::new(
            config.engine_socket.clone(),
            config.scan_sizes,
            config.scan_workers,
            remote,
        )?;

        info!(
            user_data = %config.user_data_dir.display(),
            engine_socket = %config.engine_socket.display(),
            workers = config.scan_workers,
            "content-inspection core initialised"
        );
        Ok(Self {
            scanner,
            quarantine,
            traffic: TrafficMonitor::new(),
            policy,
            degradation: Arc::new(DegradationTracker::new()),
        })
    }

    /// Full pipeline for one inbound download: policy lookup, scan,
    /// quarantine, history. `payload_path` is the on-disk temp file the
    /// download was spooled to; without it a threat is blocked rather than
    /// quarantined.
    pub fn handle_download(
        &mut self,
        meta: &DownloadMetadata,
        content: &[u8],
        payload_path: Option<&Path>,
    ) -> Result<DownloadVerdict, CoreError> {
        let mut threat_meta = ThreatMetadata {
            url: meta.url.clone(),
            filename: meta.filename.clone(),
            sha256: meta.sha256.clone(),
            mime_type: meta.mime_type.clone(),
            file_size: meta.size,
            rule_name: String::new(),
            severity: 0.0,
        };

        let (matched_policy, mut warn_floor) = self.lookup_policy(&threat_meta)?;
        if let Some(policy) = &matched_policy {
            match policy.action {
                PolicyAction::Allow => {
                    return Ok(DownloadVerdict {
                        decision: ThreatDecision::Allowed,
                        scan: None,
                        matched_policy,
                        quarantine_id: None,
                    });
                }
                PolicyAction::Block | PolicyAction::BlockAutofill => {
                    threat_meta.rule_name = policy.rule_name.clone();
                    threat_meta.severity = 1.0;
                    self.record_history(&threat_meta, ThreatDecision::Blocked, Some(policy.id), "{}");
                    return Ok(DownloadVerdict {
                        decision: ThreatDecision::Blocked,
                        scan: None,
                        matched_policy,
                        quarantine_id: None,
                    });
                }
                PolicyAction::Quarantine => {
                    threat_meta.rule_name = policy.rule_name.clone();
                    threat_meta.severity = 1.0;
                    let quarantine_id =
                        self.quarantine_payload(meta, payload_path, &[policy.rule_name.clone()]);
                    let decision = if quarantine_id.is_some() {
                        ThreatDecision::Quarantined
                    } else {
                        ThreatDecision::Blocked
                    };
                    self.record_history(&threat_meta, decision, Some(policy.id), "{}");
                    return Ok(DownloadVerdict {
                        decision,
                        scan: None,
                        matched_policy,
                        quarantine_id,
                    });
                }
                PolicyAction::WarnUser => {
                    warn_floor = true;
                }
            }
        }

        let scan = self.scanner.inspect(meta, content)?;
        if scan.is_threat {
            let alert = scan.alert.clone().unwrap_or_default();
            let rule_name = rule_from_alert(&alert);
            threat_meta.rule_name = rule_name;
            threat_meta.severity = 1.0;
            let quarantine_id = self.quarantine_payload(
                meta,
                payload_path,
                std::slice::from_ref(&threat_meta.rule_name),
            );
            let decision = if quarantine_id.is_some() {
                ThreatDecision::Quarantined
            } else {
                ThreatDecision::Blocked
            };
            let policy_id = matched_policy.as_ref().map(|p| p.id);
            self.record_history(&threat_meta, decision, policy_id, &alert);
            return Ok(DownloadVerdict {
                decision,
                scan: Some(scan),
                matched_policy,
                quarantine_id,
            });
        }

        let decision = if warn_floor {
            ThreatDecision::Warned
        } else {
            ThreatDecision::Allowed
        };
        Ok(DownloadVerdict {
            decision,
            scan: Some(scan),
            matched_policy,
            quarantine_id: None,
        })
    }

    /// Record one outbound request and re-analyse the domain. Alerts are
    /// buffered in the monitor and appended to threat history.
    pub fn observe_request(
        &mut self,
        domain: &str,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<Option<TrafficAlert>, CoreError> {
        self.traffic.record(domain, bytes_sent, bytes_received)?;
        let Some(alert) = self.traffic.analyse(domain) else {
            return Ok(None);
        };
        let threat_meta = ThreatMetadata {
            url: alert.domain.clone(),
            filename: "-".to_string(),
            sha256: NO_DIGEST.to_string(),
            mime_type: "-".to_string(),
            file_size: bytes_sent.max(1),
            rule_name: format!("traffic:{}", alert.alert_type.as_str()),
            severity: alert.severity,
        };
        let metadata_json = serde_json::to_string(&alert).unwrap_or_else(|_| "{}".to_string());
        self.record_history(&threat_meta, ThreatDecision::Warned, None, &metadata_json);
        Ok(Some(alert))
    }

    /// Policy lookup with graceful degradation: a tripped breaker or a
    /// failed database never blocks the pipeline, it floors the decision
    /// at Warn instead.
    fn lookup_policy(
        &mut self,
        threat_meta: &ThreatMetadata,
    ) -> Result<(Option<Policy>, bool), CoreError> {
        if self.degradation.should_use_fallback(Service::Database) {
            warn!("policy store marked unavailable, flooring decision at warn");
            return Ok((None, true));
        }
        match self.policy.match_policy(threat_meta) {
            Ok(policy) => {
                self.degradation.report_success(Service::Database);
                Ok((policy, false))
            }
            Err(PolicyError::CircuitOpen) => {
                warn!("Security: policy circuit open, flooring decision at warn");
                Ok((None, true))
            }
            Err(err @ PolicyError::Invalid(_)) => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "policy lookup failed, flooring decision at warn");
                self.degradation.report_failure(Service::Database);
                Ok((None, true))
            }
        }
    }

    fn quarantine_payload(
        &self,
        meta: &DownloadMetadata,
        payload_path: Option<&Path>,
        rule_names: &[String],
    ) -> Option<String> {
        let path = payload_path?;
        let info = QuarantineFileInfo {
            original_url: meta.url.clone(),
            filename: meta.filename.clone(),
            sha256: meta.sha256.clone(),
            file_size: meta.size,
            rule_names: rule_names.to_vec(),
        };
        match self.quarantine.quarantine_file(path, &info) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(url = %meta.url, error = %err, "Security: quarantine failed, blocking instead");
                None
            }
        }
    }

    /// History is best-effort: a failure to record never blocks the
    /// pipeline's decision.
    fn record_history(
        &mut self,
        threat_meta: &ThreatMetadata,
        decision: ThreatDecision,
        policy_id: Option<i64>,
        metadata_json: &str,
    ) {
        match self
            .policy
            .record_threat(threat_meta, decision, policy_id, metadata_json)
        {
            Ok(_) => self.degradation.report_success(Service::Database),
            Err(PolicyError::CircuitOpen) => {
                warn!("Security: threat history not recorded, circuit open")
            }
            Err(err) => {
                warn!(error = %err, "Security: threat history not recorded");
                self.degradation.report_failure(Service::Database);
            }
        }
    }

    pub fn scanner(&self) -> &SecurityTap {
        &self.scanner
    }

    pub fn quarantine(&self) -> &QuarantineStore {
        &self.quarantine
    }

    pub fn traffic(&self) -> &TrafficMonitor {
        &self.traffic
    }

    pub fn policy_mut(&mut self) -> &mut PolicyGraph {
        &mut self.policy
    }

    pub fn degradation(&self) -> Arc<DegradationTracker> {
        Arc::clone(&self.degradation)
    }

    /// Cooperative shutdown; idempotent.
    pub fn shutdown(&mut self) {
        self.scanner.stop();
    }
}

/// Pull the rule name out of an engine alert, which is opaque JSON that by
/// convention carries a `rule` key.
fn rule_from_alert(alert: &str) -> String {
    serde_json::from_str::<serde_json::Value>(alert)
        .ok()
        .and_then(|value| value.get("rule").and_then(|r| r.as_str()).map(str::to_string))
        .unwrap_or_else(|| "signature-engine".to_string())
}
