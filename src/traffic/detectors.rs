//! Behavioural Detectors
//! =====================
//! Statistical analysers feeding the traffic monitor: domain-generation
//! heuristics, beaconing regularity, and exfiltration upload ratios.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use statrs::statistics::Statistics;
use tracing::debug;

use super::TrafficError;

/// Entropy is normalised against this many bits; random-looking labels sit
/// near 4.5-5.0.
const ENTROPY_NORM: f64 = 5.0;
/// Combined-score threshold above which the analyser flags a domain as DGA.
const DGA_FLAG_THRESHOLD: f64 = 0.75;
/// Labels shorter than this are never flagged; DGA names are long.
const DGA_MIN_LABEL_LEN: usize = 7;
/// A CV under this is regular enough to flag as beaconing outright.
const BEACON_FLAG_CV: f64 = 0.15;
/// CVs under this contribute linearly to the beaconing score.
const BEACON_SCORE_CV: f64 = 0.4;
/// Minimum interval count before the beaconing flag may be raised.
const BEACON_MIN_INTERVALS: usize = 5;
/// Upload ratios above this contribute linearly to the exfiltration score.
const EXFIL_SCORE_RATIO: f64 = 0.7;
/// Ratio and volume at which the analyser flags exfiltration outright.
const EXFIL_FLAG_RATIO: f64 = 0.9;
const EXFIL_FLAG_MIN_SENT: u64 = 1024 * 1024;

/// Common English words the bigram plausibility table is trained on.
const BIGRAM_CORPUS: &str = "the be to of and a in that have I it for not on with he as you do \
    at this but his by from they we say her she or an will my one all would there their what so \
    up out if about who get which go me when make can like time no just him know take people \
    into year your good some could them see other than then now look only come its over think \
    also back after use two how our work first well way even new want because any these give \
    day most us account address browser cache certificate client connect content cookie data \
    document domain download engine error event file frame header history image index internet \
    link load local mail media message network online page password policy privacy profile \
    proxy public request response search secure security server service session site socket \
    storage stream system update upload video window";

/// Verdict from [`DomainAnalyzer::evaluate`].
#[derive(Debug, Clone)]
pub struct DomainVerdict {
    pub dga_score: f64,
    pub is_dga: bool,
    pub confidence: f64,
    pub entropy: f64,
    pub bigram_rarity: f64,
    pub consonant_ratio: f64,
    pub dns_tunnel_score: f64,
}

/// Lexical analyser for domain names. Flags machine-generated names by
/// combining Shannon entropy, bigram plausibility against English, and the
/// consonant ratio; also scores DNS-tunnel-shaped label structure.
pub struct DomainAnalyzer {
    bigram_counts: [[u32; 26]; 26],
}

impl DomainAnalyzer {
    pub fn new() -> Result<Self, TrafficError> {
        let mut counts = [[0u32; 26]; 26];
        let mut total = 0u64;
        for word in BIGRAM_CORPUS.split_whitespace() {
            let letters: Vec<usize> = word
                .chars()
                .map(|c| c.to_ascii_lowercase())
                .filter(|c| c.is_ascii_lowercase())
                .map(|c| (c as u8 - b'a') as usize)
                .collect();
            for pair in letters.windows(2) {
                counts[pair[0]][pair[1]] += 1;
                total += 1;
            }
        }
        if total == 0 {
            return Err(TrafficError::DetectorInit {
                detector: "domain",
                reason: "empty bigram corpus".to_string(),
            });
        }
        Ok(Self {
            bigram_counts: counts,
        })
    }

    pub fn evaluate(&self, domain: &str) -> DomainVerdict {
        let label = core_label(domain);
        let entropy = shannon_entropy(label.as_bytes());
        let entropy_component = (entropy / ENTROPY_NORM).min(1.0);
        let bigram_rarity = self.bigram_rarity(&label);
        let consonant_ratio = consonant_ratio(&label);
        let consonant_component = ((consonant_ratio - 0.5) / 0.5).clamp(0.0, 1.0);

        let dga_score = 0.4 * entropy_component + 0.35 * bigram_rarity + 0.25 * consonant_component;
        let is_dga = dga_score >= DGA_FLAG_THRESHOLD && label.len() >= DGA_MIN_LABEL_LEN;
        if is_dga {
            debug!(domain, score = dga_score, "Security: domain flagged as DGA-generated");
        }

        DomainVerdict {
            dga_score,
            is_dga,
            confidence: dga_score,
            entropy,
            bigram_rarity,
            consonant_ratio,
            dns_tunnel_score: dns_tunnel_score(domain),
        }
    }

    /// Fraction of adjacent character pairs never seen in English text.
    /// Pairs involving digits or punctuation count as rare.
    fn bigram_rarity(&self, label: &str) -> f64 {
        let chars: Vec<char> = label.chars().collect();
        if chars.len() < 2 {
            return 0.0;
        }
        let mut rare = 0usize;
        let mut total = 0usize;
        for pair in chars.windows(2) {
            total += 1;
            let (a, b) = (pair[0].to_ascii_lowercase(), pair[1].to_ascii_lowercase());
            if !a.is_ascii_lowercase() || !b.is_ascii_lowercase() {
                rare += 1;
                continue;
            }
            let (i, j) = ((a as u8 - b'a') as usize, (b as u8 - b'a') as usize);
            if self.bigram_counts[i][j] == 0 {
                rare += 1;
            }
        }
        rare as f64 / total as f64
    }
}

/// Verdict from [`BeaconAnalyzer::evaluate`].
#[derive(Debug, Clone)]
pub struct BeaconVerdict {
    pub cv: Option<f64>,
    pub score: f64,
    pub is_beaconing: bool,
    pub confidence: f64,
}

/// Detects periodic callbacks from the regularity of inter-request
/// intervals, measured as the coefficient of variation.
pub struct BeaconAnalyzer;

impl BeaconAnalyzer {
    pub fn new() -> Result<Self, TrafficError> {
        Ok(Self)
    }

    /// `intervals` are the gaps between consecutive requests, in seconds.
    pub fn evaluate(&self, intervals: &[f64]) -> BeaconVerdict {
        if intervals.len() < 2 {
            return BeaconVerdict {
                cv: None,
                score: 0.0,
                is_beaconing: false,
                confidence: 0.0,
            };
        }
        let mean = Statistics::mean(intervals);
        if !(mean > 0.0) {
            return BeaconVerdict {
                cv: None,
                score: 0.0,
                is_beaconing: false,
                confidence: 0.0,
            };
        }
        let cv = Statistics::std_dev(intervals) / mean;
        let score = ((BEACON_SCORE_CV - cv) / BEACON_SCORE_CV).clamp(0.0, 1.0);
        let is_beaconing = cv < BEACON_FLAG_CV && intervals.len() >= BEACON_MIN_INTERVALS;
        let confidence = (1.0 - 2.0 * cv).clamp(0.0, 1.0);
        BeaconVerdict {
            cv: Some(cv),
            score,
            is_beaconing,
            confidence,
        }
    }
}

/// Verdict from [`ExfilAnalyzer::evaluate`].
#[derive(Debug, Clone)]
pub struct ExfilVerdict {
    pub upload_ratio: f64,
    pub score: f64,
    pub is_exfiltration: bool,
    pub confidence: f64,
}

/// Detects outbound data theft from the upload/download byte ratio.
pub struct ExfilAnalyzer;

impl ExfilAnalyzer {
    pub fn new() -> Result<Self, TrafficError> {
        Ok(Self)
    }

    pub fn evaluate(&self, bytes_sent: u64, bytes_received: u64) -> ExfilVerdict {
        let total = bytes_sent + bytes_received;
        let ratio = if total == 0 {
            0.0
        } else {
            bytes_sent as f64 / total as f64
        };
        let score = ((ratio - EXFIL_SCORE_RATIO) / (1.0 - EXFIL_SCORE_RATIO)).clamp(0.0, 1.0);
        let is_exfiltration = ratio >= EXFIL_FLAG_RATIO && bytes_sent >= EXFIL_FLAG_MIN_SENT;
        ExfilVerdict {
            upload_ratio: ratio,
            score,
            is_exfiltration,
            confidence: ratio.min(1.0),
        }
    }
}

/// The registrable label of a domain: the label left of the public suffix,
/// approximated as the second-to-last dot-separated label.
fn core_label(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 => String::new(),
        1 => labels[0].to_ascii_lowercase(),
        n => labels[n - 2].to_ascii_lowercase(),
    }
}

fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }
    let len = data.len() as f64;
    let mut entropy = 0.0;
    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy
}

fn consonant_ratio(label: &str) -> f64 {
    let mut letters = 0u32;
    let mut consonants = 0u32;
    for c in label.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() {
            letters += 1;
            if !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u') {
                consonants += 1;
            }
        }
    }
    if letters == 0 {
        0.0
    } else {
        consonants as f64 / letters as f64
    }
}

/// DNS tunnels encode data in long, numerous, high-entropy labels. Three
/// structural measurements each contribute a third of the score.
fn dns_tunnel_score(domain: &str) -> f64 {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return 0.0;
    }
    let label_count = labels.len() as f64;
    let mean_len =
        labels.iter().map(|l| l.len()).sum::<usize>() as f64 / label_count;
    let subdomain: String = if labels.len() > 2 {
        labels[..labels.len() - 2].join("")
    } else {
        String::new()
    };
    let sub_entropy = shannon_entropy(subdomain.as_bytes());

    let count_component = ((label_count - 2.0) / 4.0).clamp(0.0, 1.0);
    let length_component = ((mean_len - 10.0) / 20.0).clamp(0.0, 1.0);
    let entropy_component = ((sub_entropy - 2.5) / 1.5).clamp(0.0, 1.0);
    (count_component + length_component + entropy_component) / 3.0
}
