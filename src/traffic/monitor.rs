//! Traffic Monitor
//! ===============
//! Per-domain behavioural aggregation. Classifies request streams into
//! DGA, beaconing, exfiltration, or DNS-tunneling threats via composite
//! scoring. Accessed only from the event-loop thread.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use super::detectors::{BeaconAnalyzer, DomainAnalyzer, ExfilAnalyzer};
use super::TrafficError;
use crate::metrics::TRAFFIC_ALERTS_TOTAL;
use crate::validators;

/// At most this many per-domain patterns are retained.
pub const MAX_PATTERNS: usize = 500;
/// At most this many alerts are buffered (FIFO eviction).
pub const MAX_ALERTS: usize = 100;
/// A domain is not analysed until it has at least this many requests.
pub const MIN_REQUESTS_FOR_ANALYSIS: u64 = 5;
/// A domain is re-analysed at most once per interval.
pub const ANALYSIS_INTERVAL_SECS: f64 = 300.0;
/// Composite score at or above which an alert is emitted.
pub const ALERT_THRESHOLD: f64 = 0.7;
/// Per-component score above which a component counts toward `Combined`.
const COMPONENT_THRESHOLD: f64 = 0.7;
/// Retained timestamps per pattern; matches the boundary vector cap.
const MAX_TIMESTAMPS: usize = validators::MAX_VEC_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrafficAlertType {
    Dga,
    Beaconing,
    Exfiltration,
    DnsTunneling,
    Combined,
}

impl TrafficAlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficAlertType::Dga => "dga",
            TrafficAlertType::Beaconing => "beaconing",
            TrafficAlertType::Exfiltration => "exfiltration",
            TrafficAlertType::DnsTunneling => "dns_tunneling",
            TrafficAlertType::Combined => "combined",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficAlert {
    pub alert_type: TrafficAlertType,
    pub domain: String,
    pub severity: f64,
    pub explanation: String,
    pub indicators: Vec<String>,
}

/// Aggregated per-domain observations. Timestamps are monotonic seconds
/// since monitor construction and are non-decreasing by construction.
#[derive(Debug, Clone)]
pub struct ConnectionPattern {
    pub domain: String,
    pub request_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub request_timestamps: Vec<f64>,
    pub last_analyzed: Option<f64>,
}

pub struct TrafficMonitor {
    started: Instant,
    patterns: HashMap<String, ConnectionPattern>,
    alerts: VecDeque<TrafficAlert>,
    domain_analyzer: Option<DomainAnalyzer>,
    beacon_analyzer: Option<BeaconAnalyzer>,
    exfil_analyzer: Option<ExfilAnalyzer>,
}

impl TrafficMonitor {
    /// Detector construction failures degrade the monitor rather than
    /// disabling it: a missing detector contributes score zero.
    pub fn new() -> Self {
        let domain_analyzer = match DomainAnalyzer::new() {
            Ok(analyzer) => Some(analyzer),
            Err(err) => {
                warn!(error = %err, "domain analyzer unavailable, DGA scoring disabled");
                None
            }
        };
        let beacon_analyzer = match BeaconAnalyzer::new() {
            Ok(analyzer) => Some(analyzer),
            Err(err) => {
                warn!(error = %err, "beacon analyzer unavailable, beaconing scoring disabled");
                None
            }
        };
        let exfil_analyzer = match ExfilAnalyzer::new() {
            Ok(analyzer) => Some(analyzer),
            Err(err) => {
                warn!(error = %err, "exfiltration analyzer unavailable, exfil scoring disabled");
                None
            }
        };
        Self {
            started: Instant::now(),
            patterns: HashMap::new(),
            alerts: VecDeque::new(),
            domain_analyzer,
            beacon_analyzer,
            exfil_analyzer,
        }
    }

    /// Record one observed request. O(1) amortised.
    pub fn record(
        &mut self,
        domain: &str,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<(), TrafficError> {
        let now = self.now();
        self.record_at(domain, bytes_sent, bytes_received, now)
    }

    pub(crate) fn record_at(
        &mut self,
        domain: &str,
        bytes_sent: u64,
        bytes_received: u64,
        now: f64,
    ) -> Result<(), TrafficError> {
        if domain.is_empty() {
            return Err(TrafficError::EmptyDomain);
        }
        validators::check_string("domain", domain)?;

        if !self.patterns.contains_key(domain) && self.patterns.len() >= MAX_PATTERNS {
            self.evict_stalest();
        }
        let pattern = self
            .patterns
            .entry(domain.to_string())
            .or_insert_with(|| ConnectionPattern {
                domain: domain.to_string(),
                request_count: 0,
                bytes_sent: 0,
                bytes_received: 0,
                request_timestamps: Vec::new(),
                last_analyzed: None,
            });
        pattern.request_count += 1;
        pattern.bytes_sent = pattern.bytes_sent.saturating_add(bytes_sent);
        pattern.bytes_received = pattern.bytes_received.saturating_add(bytes_received);
        pattern.request_timestamps.push(now);
        if pattern.request_timestamps.len() > MAX_TIMESTAMPS {
            pattern.request_timestamps.remove(0);
        }
        Ok(())
    }

    /// Analyse one domain; returns at most one alert, and at most one per
    /// domain per [`ANALYSIS_INTERVAL_SECS`].
    pub fn analyse(&mut self, domain: &str) -> Option<TrafficAlert> {
        let now = self.now();
        self.analyse_at(domain, now)
    }

    pub(crate) fn analyse_at(&mut self, domain: &str, now: f64) -> Option<TrafficAlert> {
        {
            let pattern = self.patterns.get(domain)?;
            if pattern.request_count < MIN_REQUESTS_FOR_ANALYSIS {
                return None;
            }
            if let Some(last) = pattern.last_analyzed {
                if now - last < ANALYSIS_INTERVAL_SECS {
                    return None;
                }
            }
        }

        let (dga, dns_tunnel, domain_verdict) = match &self.domain_analyzer {
            Some(analyzer) => {
                let verdict = analyzer.evaluate(domain);
                let dga = if verdict.is_dga {
                    verdict.confidence
                } else {
                    verdict.dga_score
                };
                (dga, verdict.dns_tunnel_score, Some(verdict))
            }
            None => (0.0, 0.0, None),
        };

        let pattern = self.patterns.get_mut(domain)?;
        let intervals: Vec<f64> = pattern
            .request_timestamps
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect();
        let beacon_verdict = self.beacon_analyzer.as_ref().map(|a| a.evaluate(&intervals));
        let beacon = beacon_verdict
            .as_ref()
            .map(|v| if v.is_beaconing { v.confidence } else { v.score })
            .unwrap_or(0.0);
        let exfil_verdict = self
            .exfil_analyzer
            .as_ref()
            .map(|a| a.evaluate(pattern.bytes_sent, pattern.bytes_received));
        let exfil = exfil_verdict
            .as_ref()
            .map(|v| if v.is_exfiltration { v.confidence } else { v.score })
            .unwrap_or(0.0);

        pattern.last_analyzed = Some(now);

        let composite = 0.3 * dga + 0.3 * beacon + 0.2 * exfil + 0.2 * dns_tunnel;
        if composite < ALERT_THRESHOLD {
            return None;
        }

        let components = [
            (TrafficAlertType::Dga, dga),
            (TrafficAlertType::Beaconing, beacon),
            (TrafficAlertType::Exfiltration, exfil),
            (TrafficAlertType::DnsTunneling, dns_tunnel),
        ];
        let over_threshold = components
            .iter()
            .filter(|(_, score)| *score > COMPONENT_THRESHOLD)
            .count();
        let alert_type = if over_threshold >= 2 {
            TrafficAlertType::Combined
        } else {
            components
                .iter()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(kind, _)| *kind)
                .unwrap_or(TrafficAlertType::Combined)
        };

        let mut indicators = Vec::new();
        if let Some(v) = &domain_verdict {
            if dga > COMPONENT_THRESHOLD {
                indicators.push(format!(
                    "DGA-like name (score {dga:.2}, entropy {:.2}, bigram rarity {:.2})",
                    v.entropy, v.bigram_rarity
                ));
            }
            if dns_tunnel > COMPONENT_THRESHOLD {
                indicators.push(format!("DNS-tunnel label structure (score {dns_tunnel:.2})"));
            }
        }
        if let Some(v) = &beacon_verdict {
            if beacon > COMPONENT_THRESHOLD {
                let cv = v.cv.unwrap_or(f64::NAN);
                indicators.push(format!(
                    "beaconing cadence (score {beacon:.2}, interval cv {cv:.3})"
                ));
            }
        }
        if let Some(v) = &exfil_verdict {
            if exfil > COMPONENT_THRESHOLD {
                indicators.push(format!(
                    "exfiltration upload ratio {:.2} (score {exfil:.2})",
                    v.upload_ratio
                ));
            }
        }
        indicators.push(format!(
            "requests {} sent {} received {}",
            pattern.request_count, pattern.bytes_sent, pattern.bytes_received
        ));

        let alert = TrafficAlert {
            alert_type,
            domain: domain.to_string(),
            severity: composite.min(1.0),
            explanation: format!(
                "composite threat score {composite:.2} for {domain} (dga {dga:.2}, beaconing {beacon:.2}, exfiltration {exfil:.2}, dns-tunnel {dns_tunnel:.2})"
            ),
            indicators,
        };
        info!(
            domain,
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity,
            "Security: traffic alert raised"
        );
        TRAFFIC_ALERTS_TOTAL
            .with_label_values(&[alert.alert_type.as_str()])
            .inc();

        if self.alerts.len() >= MAX_ALERTS {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert.clone());
        Some(alert)
    }

    /// The most recent alerts, oldest first, at most `max_count`.
    pub fn recent_alerts(&self, max_count: usize) -> Vec<TrafficAlert> {
        let skip = self.alerts.len().saturating_sub(max_count);
        self.alerts.iter().skip(skip).cloned().collect()
    }

    pub fn pattern(&self, domain: &str) -> Option<&ConnectionPattern> {
        self.patterns.get(domain)
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .patterns
            .values()
            .min_by(|a, b| {
                let a_key = a.last_analyzed.unwrap_or(-1.0);
                let b_key = b.last_analyzed.unwrap_or(-1.0);
                a_key
                    .partial_cmp(&b_key)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|p| p.domain.clone());
        if let Some(domain) = stalest {
            self.patterns.remove(&domain);
        }
    }
}

impl Default for TrafficMonitor {
    fn default() -> Self {
        Self::new()
    }
}
