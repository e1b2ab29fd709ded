//! PolicyGraph Store
//! =================
//! Transactional, parameterised policy and threat-history store. Answers
//! "what should happen given this threat" from an LRU decision cache or a
//! prepared-statement query; no user input ever reaches SQL text.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use super::decision_cache::{CacheStats, DecisionCache, DecisionKey};
use super::PolicyError;
use crate::metrics::POLICY_DECISIONS_TOTAL;
use crate::validators::{self, MAX_POLICY_URL_LEN, MAX_URL_LEN};

/// Enforcement action attached to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Block,
    Quarantine,
    BlockAutofill,
    WarnUser,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Block => "block",
            PolicyAction::Quarantine => "quarantine",
            PolicyAction::BlockAutofill => "block_autofill",
            PolicyAction::WarnUser => "warn_user",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "allow" => Some(PolicyAction::Allow),
            "block" => Some(PolicyAction::Block),
            "quarantine" => Some(PolicyAction::Quarantine),
            "block_autofill" => Some(PolicyAction::BlockAutofill),
            "warn_user" => Some(PolicyAction::WarnUser),
            _ => None,
        }
    }
}

/// Decision recorded into threat history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatDecision {
    Allowed,
    Blocked,
    Quarantined,
    Warned,
}

impl ThreatDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatDecision::Allowed => "allowed",
            ThreatDecision::Blocked => "blocked",
            ThreatDecision::Quarantined => "quarantined",
            ThreatDecision::Warned => "warned",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub id: i64,
    pub rule_name: String,
    pub url_pattern: Option<String>,
    pub file_hash: Option<String>,
    pub mime_type: Option<String>,
    pub action: PolicyAction,
    pub created_at: i64,
    pub created_by: String,
    pub expires_at: Option<i64>,
    pub last_hit: Option<i64>,
}

/// Fields for a policy being created; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub rule_name: String,
    pub url_pattern: Option<String>,
    pub file_hash: Option<String>,
    pub mime_type: Option<String>,
    pub action: PolicyAction,
    pub created_by: String,
    pub expires_at: Option<i64>,
}

/// The facts about a threat that policies are matched against and threat
/// history records.
#[derive(Debug, Clone)]
pub struct ThreatMetadata {
    pub url: String,
    pub filename: String,
    pub sha256: String,
    pub mime_type: String,
    pub file_size: u64,
    pub rule_name: String,
    pub severity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreatRecord {
    pub id: i64,
    pub url: String,
    pub filename: String,
    pub sha256: String,
    pub mime_type: String,
    pub file_size: u64,
    pub rule_name: String,
    pub severity: f64,
    pub decision: String,
    pub matched_policy_id: Option<i64>,
    pub metadata_json: String,
    pub recorded_at: i64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_name TEXT NOT NULL,
    url_pattern TEXT,
    file_hash TEXT,
    mime_type TEXT,
    action TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    expires_at INTEGER,
    last_hit INTEGER
);
CREATE TABLE IF NOT EXISTS threat_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    filename TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    rule_name TEXT NOT NULL,
    severity REAL NOT NULL,
    decision TEXT NOT NULL,
    matched_policy_id INTEGER REFERENCES policies(id),
    metadata_json TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS trusted_relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_origin TEXT NOT NULL,
    target_origin TEXT NOT NULL,
    trust_level REAL NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (source_origin, target_origin)
);
CREATE INDEX IF NOT EXISTS idx_policies_file_hash ON policies (file_hash);
CREATE INDEX IF NOT EXISTS idx_threat_history_recorded_at ON threat_history (recorded_at);
";

/// Most-specific match: count of non-null constraint columns descending,
/// then newest policy wins.
const MATCH_SQL: &str = "
SELECT id, rule_name, url_pattern, file_hash, mime_type, action,
       created_at, created_by, expires_at, last_hit
FROM policies
WHERE (url_pattern IS NULL OR ?1 LIKE url_pattern)
  AND (file_hash IS NULL OR file_hash = ?2)
  AND (mime_type IS NULL OR mime_type = ?3)
  AND (expires_at IS NULL OR expires_at > ?4)
ORDER BY (url_pattern IS NOT NULL) + (file_hash IS NOT NULL) + (mime_type IS NOT NULL) DESC,
         created_at DESC,
         id DESC
LIMIT 1
";

pub struct PolicyGraph {
    conn: Connection,
    cache: DecisionCache,
    breaker: CircuitBreaker,
}

impl PolicyGraph {
    pub fn open(
        path: &Path,
        cache_capacity: usize,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, PolicyError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, cache_capacity, breaker_config)
    }

    /// In-memory store, used by tests and as a last-resort fallback when
    /// the on-disk database cannot be opened.
    pub fn open_in_memory(
        cache_capacity: usize,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, PolicyError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, cache_capacity, breaker_config)
    }

    fn from_connection(
        conn: Connection,
        cache_capacity: usize,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, PolicyError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .optional()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            cache: DecisionCache::new(cache_capacity),
            breaker: CircuitBreaker::new(breaker_config),
        })
    }

    /// Select the most specific non-expired policy matching the threat, or
    /// `None`. Consults the decision cache first; a cache hit never
    /// disagrees with a cold read because every mutation clears the cache.
    pub fn match_policy(&mut self, meta: &ThreatMetadata) -> Result<Option<Policy>, PolicyError> {
        self.validate_threat(meta)?;
        let key = DecisionKey {
            url: meta.url.clone(),
            file_hash: meta.sha256.clone(),
            mime_type: meta.mime_type.clone(),
            rule_name: meta.rule_name.clone(),
        };
        if let Some(decision) = self.cache.get(&key) {
            let action = decision
                .as_ref()
                .map(|p| p.action.as_str())
                .unwrap_or("none");
            POLICY_DECISIONS_TOTAL
                .with_label_values(&[action, "cache"])
                .inc();
            return Ok(decision);
        }

        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = self.query_best_match(meta);
        self.breaker.observe(result.is_ok());
        let policy = result?;
        let action = policy.as_ref().map(|p| p.action.as_str()).unwrap_or("none");
        POLICY_DECISIONS_TOTAL
            .with_label_values(&[action, "store"])
            .inc();
        self.cache.put(key, policy.clone());
        Ok(policy)
    }

    fn query_best_match(&mut self, meta: &ThreatMetadata) -> Result<Option<Policy>, rusqlite::Error> {
        let now = Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        let policy = tx
            .query_row(
                MATCH_SQL,
                params![meta.url, meta.sha256, meta.mime_type, now],
                row_to_policy,
            )
            .optional()?;
        if let Some(found) = &policy {
            tx.execute(
                "UPDATE policies SET last_hit = ?1 WHERE id = ?2",
                params![now, found.id],
            )?;
        }
        tx.commit()?;
        Ok(policy)
    }

    /// Append one row of threat history. Append-only; concurrent writers
    /// are serialised by the connection.
    pub fn record_threat(
        &mut self,
        meta: &ThreatMetadata,
        decision: ThreatDecision,
        matched_policy_id: Option<i64>,
        metadata_json: &str,
    ) -> Result<i64, PolicyError> {
        self.validate_threat(meta)?;
        validators::check_string("metadata_json", metadata_json)?;
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = self.conn.execute(
            "INSERT INTO threat_history (url, filename, sha256, mime_type, file_size,
                 rule_name, severity, decision, matched_policy_id, metadata_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                meta.url,
                meta.filename,
                meta.sha256,
                meta.mime_type,
                meta.file_size as i64,
                meta.rule_name,
                meta.severity,
                decision.as_str(),
                matched_policy_id,
                metadata_json,
                Utc::now().timestamp(),
            ],
        );
        self.breaker.observe(result.is_ok());
        result?;
        let id = self.conn.last_insert_rowid();
        debug!(id, decision = decision.as_str(), "threat recorded");
        Ok(id)
    }

    pub fn add_policy(&mut self, policy: &NewPolicy) -> Result<i64, PolicyError> {
        validators::check_string("rule_name", &policy.rule_name)?;
        if let Some(pattern) = &policy.url_pattern {
            validators::check_url("url_pattern", pattern, MAX_POLICY_URL_LEN)?;
        }
        if let Some(hash) = &policy.file_hash {
            validators::check_sha256(hash)?;
        }
        if let Some(mime) = &policy.mime_type {
            validators::check_string("mime_type", mime)?;
        }
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = self.conn.execute(
            "INSERT INTO policies (rule_name, url_pattern, file_hash, mime_type, action,
                 created_at, created_by, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                policy.rule_name,
                policy.url_pattern,
                policy.file_hash,
                policy.mime_type,
                policy.action.as_str(),
                Utc::now().timestamp(),
                policy.created_by,
                policy.expires_at,
            ],
        );
        self.breaker.observe(result.is_ok());
        result?;
        self.cache.clear();
        Ok(self.conn.last_insert_rowid())
    }

    /// Returns true when a policy was removed.
    pub fn remove_policy(&mut self, id: i64) -> Result<bool, PolicyError> {
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = self
            .conn
            .execute("DELETE FROM policies WHERE id = ?1", params![id]);
        self.breaker.observe(result.is_ok());
        let changed = result? > 0;
        if changed {
            self.cache.clear();
        }
        Ok(changed)
    }

    pub fn list_policies(&mut self) -> Result<Vec<Policy>, PolicyError> {
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = (|| {
            let mut stmt = self.conn.prepare(
                "SELECT id, rule_name, url_pattern, file_hash, mime_type, action,
                        created_at, created_by, expires_at, last_hit
                 FROM policies ORDER BY id",
            )?;
            let rows = stmt.query_map([], row_to_policy)?;
            rows.collect::<Result<Vec<_>, _>>()
        })();
        self.breaker.observe(result.is_ok());
        Ok(result?)
    }

    /// Delete expired policies; returns how many were removed.
    pub fn cleanup_expired(&mut self) -> Result<usize, PolicyError> {
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = self.conn.execute(
            "DELETE FROM policies WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Utc::now().timestamp()],
        );
        self.breaker.observe(result.is_ok());
        let removed = result?;
        if removed > 0 {
            self.cache.clear();
        }
        Ok(removed)
    }

    pub fn recent_threats(&mut self, limit: usize) -> Result<Vec<ThreatRecord>, PolicyError> {
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = (|| {
            let mut stmt = self.conn.prepare(
                "SELECT id, url, filename, sha256, mime_type, file_size, rule_name,
                        severity, decision, matched_policy_id, metadata_json, recorded_at
                 FROM threat_history ORDER BY recorded_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_threat_record)?;
            rows.collect::<Result<Vec<_>, _>>()
        })();
        self.breaker.observe(result.is_ok());
        Ok(result?)
    }

    pub fn add_trusted_relationship(
        &mut self,
        source_origin: &str,
        target_origin: &str,
        trust_level: f64,
    ) -> Result<i64, PolicyError> {
        validators::check_url("source_origin", source_origin, MAX_URL_LEN)?;
        validators::check_url("target_origin", target_origin, MAX_URL_LEN)?;
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = self.conn.execute(
            "INSERT INTO trusted_relationships (source_origin, target_origin, trust_level, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (source_origin, target_origin)
             DO UPDATE SET trust_level = excluded.trust_level",
            params![source_origin, target_origin, trust_level, Utc::now().timestamp()],
        );
        self.breaker.observe(result.is_ok());
        result?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn is_trusted(
        &mut self,
        source_origin: &str,
        target_origin: &str,
    ) -> Result<bool, PolicyError> {
        validators::check_url("source_origin", source_origin, MAX_URL_LEN)?;
        validators::check_url("target_origin", target_origin, MAX_URL_LEN)?;
        self.breaker
            .preflight()
            .map_err(|_| PolicyError::CircuitOpen)?;
        let result = self.conn.query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM trusted_relationships
                 WHERE source_origin = ?1 AND target_origin = ?2 AND trust_level > 0
             )",
            params![source_origin, target_origin],
            |row| row.get::<_, bool>(0),
        );
        self.breaker.observe(result.is_ok());
        Ok(result?)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    fn validate_threat(&self, meta: &ThreatMetadata) -> Result<(), PolicyError> {
        validators::check_url("url", &meta.url, MAX_URL_LEN)?;
        validators::check_filename(&meta.filename)?;
        validators::check_sha256(&meta.sha256)?;
        validators::check_string("mime_type", &meta.mime_type)?;
        validators::check_string("rule_name", &meta.rule_name)?;
        Ok(())
    }
}

fn row_to_policy(row: &Row<'_>) -> rusqlite::Result<Policy> {
    let action_text: String = row.get(5)?;
    let action = PolicyAction::parse(&action_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown policy action {action_text:?}").into(),
        )
    })?;
    Ok(Policy {
        id: row.get(0)?,
        rule_name: row.get(1)?,
        url_pattern: row.get(2)?,
        file_hash: row.get(3)?,
        mime_type: row.get(4)?,
        action,
        created_at: row.get(6)?,
        created_by: row.get(7)?,
        expires_at: row.get(8)?,
        last_hit: row.get(9)?,
    })
}

fn row_to_threat_record(row: &Row<'_>) -> rusqlite::Result<ThreatRecord> {
    Ok(ThreatRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        filename: row.get(2)?,
        sha256: row.get(3)?,
        mime_type: row.get(4)?,
        file_size: row.get::<_, i64>(5)? as u64,
        rule_name: row.get(6)?,
        severity: row.get(7)?,
        decision: row.get(8)?,
        matched_policy_id: row.get(9)?,
        metadata_json: row.get(10)?,
        recorded_at: row.get(11)?,
    })
}
