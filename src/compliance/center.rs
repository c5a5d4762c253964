//! Compliance policy center with audit and replay.
//!
//! Every outbound message passes through `evaluate_before_send`; every
//! evaluation is appended to the audit table before the decision returns.
//! The audit table doubles as the rate-limit counter source.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{info, warn};

use crate::compliance::policy::{EffectivePolicy, PolicyFile};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS compliance_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT,
    account_id TEXT,
    session_id TEXT,
    action TEXT NOT NULL,
    content TEXT,
    decision TEXT NOT NULL,
    blocked INTEGER NOT NULL,
    hits_json TEXT,
    policy_scope TEXT,
    policy_version TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_compliance_audit_time ON compliance_audit(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_compliance_audit_session
ON compliance_audit(session_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_compliance_audit_account
ON compliance_audit(account_id, created_at DESC);
"#;

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceDecision {
    pub allowed: bool,
    pub blocked: bool,
    pub reason: String,
    pub hits: Vec<String>,
    pub policy_scope: String,
}

impl ComplianceDecision {
    fn allow(reason: &str, scope: &str) -> Self {
        Self {
            allowed: true,
            blocked: false,
            reason: reason.into(),
            hits: Vec::new(),
            policy_scope: scope.into(),
        }
    }

    fn block(reason: String, hits: Vec<String>, scope: &str) -> Self {
        Self {
            allowed: false,
            blocked: true,
            reason,
            hits,
            policy_scope: scope.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub actor: String,
    pub account_id: Option<String>,
    pub session_id: Option<String>,
    pub action: String,
    pub content: String,
    pub decision: String,
    pub blocked: bool,
    pub hits: Vec<String>,
    pub policy_scope: String,
    pub policy_version: String,
    pub created_at: i64,
}

struct PolicyState {
    file: PolicyFile,
    mtime: Option<SystemTime>,
}

pub struct ComplianceCenter {
    policy_path: PathBuf,
    policy: Mutex<PolicyState>,
    conn: Mutex<Connection>,
}

impl ComplianceCenter {
    pub fn open(policy_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create compliance db dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open compliance db {}", db_path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("init compliance schema")?;

        let center = Self {
            policy_path: policy_path.as_ref().to_path_buf(),
            policy: Mutex::new(PolicyState {
                file: PolicyFile::builtin_defaults(),
                mtime: None,
            }),
            conn: Mutex::new(conn),
        };
        center.reload();
        Ok(center)
    }

    /// Rebuild the in-memory policy from the YAML file. The swap is atomic
    /// under the policy lock; a broken file keeps the previous policy.
    pub fn reload(&self) {
        let (loaded, mtime) = if self.policy_path.exists() {
            let mtime = std::fs::metadata(&self.policy_path)
                .and_then(|m| m.modified())
                .ok();
            match std::fs::read_to_string(&self.policy_path) {
                Ok(raw) => match serde_yaml::from_str::<PolicyFile>(&raw) {
                    Ok(file) => (Some(file), mtime),
                    Err(e) => {
                        warn!(path = %self.policy_path.display(), error = %e, "policy YAML invalid, keeping previous policy");
                        return;
                    }
                },
                Err(e) => {
                    warn!(path = %self.policy_path.display(), error = %e, "policy file unreadable, keeping previous policy");
                    return;
                }
            }
        } else {
            (None, None)
        };

        let mut state = self.policy.lock();
        state.file = match loaded {
            Some(file) => PolicyFile::merged_over_defaults(file),
            None => PolicyFile::builtin_defaults(),
        };
        state.mtime = mtime;
        info!(version = %state.file.version, "compliance policy loaded");
    }

    fn auto_reload(&self) {
        let needs_reload = {
            let state = self.policy.lock();
            if !state.file.reload.auto_reload || !self.policy_path.exists() {
                false
            } else {
                let current = std::fs::metadata(&self.policy_path)
                    .and_then(|m| m.modified())
                    .ok();
                match (state.mtime, current) {
                    (Some(old), Some(new)) => new > old,
                    (None, Some(_)) => true,
                    _ => false,
                }
            }
        };
        if needs_reload {
            self.reload();
        }
    }

    fn resolve(&self, account_id: Option<&str>, session_id: Option<&str>) -> (EffectivePolicy, String) {
        let state = self.policy.lock();
        let effective = state.file.resolve(account_id, session_id);
        (effective, state.file.version.clone())
    }

    pub fn evaluate_before_send(
        &self,
        content: &str,
        actor: &str,
        account_id: Option<&str>,
        session_id: Option<&str>,
        action: &str,
    ) -> ComplianceDecision {
        self.auto_reload();
        let (policy, version) = self.resolve(account_id, session_id);

        let text = content.trim();
        let lowered = text.to_lowercase();
        let scope = policy.scope.clone();

        let decision = if policy
            .whitelist
            .iter()
            .any(|w| !w.is_empty() && lowered.contains(w))
        {
            ComplianceDecision::allow("whitelist_pass", &scope)
        } else {
            let stop_hits: Vec<String> = policy
                .stop_words
                .iter()
                .filter(|w| !w.is_empty() && lowered.contains(w.as_str()))
                .cloned()
                .collect();
            if !stop_hits.is_empty() {
                ComplianceDecision::block("high_risk_stop_word".into(), stop_hits, &scope)
            } else {
                let black_hits: Vec<String> = policy
                    .blacklist
                    .iter()
                    .filter(|w| !w.is_empty() && lowered.contains(w.as_str()))
                    .cloned()
                    .collect();
                if !black_hits.is_empty() {
                    ComplianceDecision::block("blacklist_hit".into(), black_hits, &scope)
                } else if let Some(reason) =
                    self.rate_limit_block(action, account_id, session_id, &policy)
                {
                    ComplianceDecision::block(reason, Vec::new(), &scope)
                } else {
                    ComplianceDecision::allow("pass", &scope)
                }
            }
        };

        if let Err(e) = self.audit(actor, account_id, session_id, action, text, &decision, &version)
        {
            warn!(error = %e, "compliance audit write failed");
        }
        decision
    }

    fn rate_limit_block(
        &self,
        action: &str,
        account_id: Option<&str>,
        session_id: Option<&str>,
        policy: &EffectivePolicy,
    ) -> Option<String> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();

        if let Some(account_id) = account_id {
            let rule = policy.account_rate;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM compliance_audit
                     WHERE account_id = ?1 AND action = ?2 AND created_at >= ?3",
                    params![account_id, action, now - rule.window_seconds],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            if count >= rule.max_messages {
                return Some(format!("account_rate_limit:{count}/{}", rule.max_messages));
            }
        }

        if let Some(session_id) = session_id {
            let rule = policy.session_rate;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM compliance_audit
                     WHERE session_id = ?1 AND action = ?2 AND created_at >= ?3",
                    params![session_id, action, now - rule.window_seconds],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            if count >= rule.max_messages {
                return Some(format!("session_rate_limit:{count}/{}", rule.max_messages));
            }
        }

        None
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        actor: &str,
        account_id: Option<&str>,
        session_id: Option<&str>,
        action: &str,
        content: &str,
        decision: &ComplianceDecision,
        policy_version: &str,
    ) -> Result<()> {
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO compliance_audit(
                    actor, account_id, session_id, action, content, decision,
                    blocked, hits_json, policy_scope, policy_version, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    actor,
                    account_id,
                    session_id,
                    action,
                    content,
                    decision.reason,
                    decision.blocked as i64,
                    serde_json::to_string(&decision.hits).unwrap_or_else(|_| "[]".into()),
                    decision.policy_scope,
                    policy_version,
                    chrono::Utc::now().timestamp(),
                ],
            )
            .context("insert compliance audit row")?;
        Ok(())
    }

    pub fn replay(
        &self,
        account_id: Option<&str>,
        session_id: Option<&str>,
        blocked_only: bool,
        limit: usize,
    ) -> Result<Vec<AuditRow>> {
        let mut sql = String::from(
            "SELECT id, actor, account_id, session_id, action, content, decision,
                    blocked, hits_json, policy_scope, policy_version, created_at
             FROM compliance_audit WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(account_id) = account_id {
            sql.push_str(" AND account_id = ?");
            args.push(Box::new(account_id.to_string()));
        }
        if let Some(session_id) = session_id {
            sql.push_str(" AND session_id = ?");
            args.push(Box::new(session_id.to_string()));
        }
        if blocked_only {
            sql.push_str(" AND blocked = 1");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        args.push(Box::new(limit.max(1) as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                let hits_json: Option<String> = row.get(8)?;
                Ok(AuditRow {
                    id: row.get(0)?,
                    actor: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    account_id: row.get(2)?,
                    session_id: row.get(3)?,
                    action: row.get(4)?,
                    content: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    decision: row.get(6)?,
                    blocked: row.get::<_, i64>(7)? != 0,
                    hits: hits_json
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or_default(),
                    policy_scope: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                    policy_version: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                    created_at: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("replay audit rows")?;
        Ok(rows)
    }

    /// Count of audit rows for a session+action, used by invariants tests.
    pub fn audit_count(&self, session_id: &str, action: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM compliance_audit WHERE session_id = ?1 AND action = ?2",
            params![session_id, action],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
