//! SQLite-backed workflow persistence.
//!
//! Owns `session_tasks`, `session_state_transitions`, `workflow_jobs`,
//! `sla_events`, and `sla_alerts`. Jobs are deduped on
//! `{session}:{hash16}:{stage}`, claimed under leases, retried with
//! exponential backoff, and recovered when leases expire.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::InboundSession;
use crate::workflow::state::{SessionStateMachine, WorkflowState};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS session_tasks (
    session_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    manual_takeover INTEGER NOT NULL DEFAULT 0,
    last_message_hash TEXT,
    peer_user_id TEXT,
    last_peer_name TEXT,
    last_item_title TEXT,
    last_error TEXT,
    context_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_state_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT NOT NULL,
    status TEXT NOT NULL,
    reason TEXT,
    metadata TEXT,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_session_time
ON session_state_transitions(session_id, created_at DESC);

CREATE TABLE IF NOT EXISTS workflow_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dedupe_key TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_run_at TEXT NOT NULL,
    lease_until TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflow_jobs_pending
ON workflow_jobs(status, next_run_at);

CREATE TABLE IF NOT EXISTS sla_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    outcome TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    quote_fallback INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sla_events_time
ON sla_events(created_at DESC);

CREATE TABLE IF NOT EXISTS sla_alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_type TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
"#;

#[derive(Debug, Clone, Serialize)]
pub struct SessionTask {
    pub session_id: String,
    pub state: WorkflowState,
    pub manual_takeover: bool,
    pub last_message_hash: String,
    pub peer_user_id: String,
    pub last_peer_name: String,
    pub last_item_title: String,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Conversation context persisted inside the session row: pending quote
/// fields, couriers offered in the last quote, and the outbound send log
/// the cooldown policy reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionContext {
    pub pending_origin: Option<String>,
    pub pending_destination: Option<String>,
    pub pending_weight_kg: Option<f64>,
    pub pending_volume_cc: Option<f64>,
    pub pending_volume_weight_kg: Option<f64>,
    pub quoted_couriers: Vec<String>,
    pub courier_locked: bool,
    pub locked_courier: Option<String>,
    pub first_reply_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
    pub outbound_timestamps: Vec<i64>,
    pub blocked_count: u32,
    pub last_block_reason: Option<String>,
    pub followup_sent_count: u32,
    pub last_followup_at: Option<i64>,
    pub last_inbound_message: Option<String>,
    pub opted_out: bool,
}

#[derive(Debug, Clone)]
pub struct WorkflowJob {
    pub id: i64,
    pub session_id: String,
    pub stage: String,
    pub payload: InboundSession,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub dedupe_key: String,
    pub session_id: String,
    pub status: String,
    pub attempts: u32,
    pub next_run_at: String,
    pub lease_until: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRow {
    pub id: i64,
    pub session_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub status: String,
    pub reason: Option<String>,
    pub metadata: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlaSummary {
    pub window_minutes: i64,
    pub event_count: usize,
    pub first_reply_p50_ms: i64,
    pub first_reply_p95_ms: i64,
    pub quote_total: usize,
    pub quote_success_rate: f64,
    pub quote_fallback_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub jobs: BTreeMap<String, i64>,
    pub states: BTreeMap<String, i64>,
    pub manual_takeover_sessions: i64,
}

pub struct WorkflowStore {
    conn: Mutex<Connection>,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn now_ts() -> String {
    format_ts(Utc::now())
}

fn ts_after_seconds(seconds: i64) -> String {
    format_ts(Utc::now() + ChronoDuration::seconds(seconds))
}

impl WorkflowStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create workflow db dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open workflow db {}", db_path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("init workflow schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── session tasks ──

    /// Insert-or-refresh the session row from an inbound snapshot.
    pub fn ensure_session(&self, session: &InboundSession) -> Result<()> {
        if session.session_id.is_empty() {
            return Ok(());
        }
        let message_hash = crate::transport::wire::sha1_hex(&session.last_message);
        let now = now_ts();
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO session_tasks(
                    session_id, state, manual_takeover, last_message_hash, peer_user_id,
                    last_peer_name, last_item_title, created_at, updated_at
                ) VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(session_id) DO UPDATE SET
                    last_message_hash = excluded.last_message_hash,
                    peer_user_id = CASE
                        WHEN excluded.peer_user_id != '' THEN excluded.peer_user_id
                        ELSE session_tasks.peer_user_id
                    END,
                    last_peer_name = excluded.last_peer_name,
                    last_item_title = excluded.last_item_title,
                    updated_at = excluded.updated_at
                "#,
                params![
                    session.session_id,
                    WorkflowState::New.as_str(),
                    message_hash,
                    session.sender_user_id,
                    session.peer_name,
                    session.item_title,
                    now,
                ],
            )
            .context("ensure session row")?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionTask>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT session_id, state, manual_takeover, last_message_hash, peer_user_id,
                        last_peer_name, last_item_title, last_error, created_at, updated_at
                 FROM session_tasks WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionTask {
                        session_id: row.get(0)?,
                        state: WorkflowState::parse(&row.get::<_, String>(1)?)
                            .unwrap_or(WorkflowState::New),
                        manual_takeover: row.get::<_, i64>(2)? != 0,
                        last_message_hash: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_default(),
                        peer_user_id: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        last_peer_name: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        last_item_title: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                        last_error: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .context("query session task")?;
        Ok(row)
    }

    pub fn set_manual_takeover(&self, session_id: &str, enabled: bool) -> Result<bool> {
        let now = now_ts();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO session_tasks(session_id, state, manual_takeover, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![session_id, WorkflowState::New.as_str(), now],
        )?;
        let changed = conn.execute(
            "UPDATE session_tasks SET manual_takeover = ?1, state = ?2, updated_at = ?3
             WHERE session_id = ?4",
            params![
                enabled as i64,
                if enabled {
                    WorkflowState::Manual.as_str()
                } else {
                    WorkflowState::Replied.as_str()
                },
                now,
                session_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Apply a transition if the table allows it. Every attempt lands in
    /// the transition audit; rejected attempts do not mutate the state.
    pub fn transition_state(
        &self,
        session_id: &str,
        to_state: WorkflowState,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool> {
        let now = now_ts();
        let metadata_json =
            serde_json::to_string(&metadata.unwrap_or_else(|| serde_json::json!({})))
                .unwrap_or_else(|_| "{}".into());

        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT state FROM session_tasks WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let from_state = current
            .as_deref()
            .and_then(WorkflowState::parse)
            .unwrap_or(WorkflowState::New);
        if current.is_none() {
            conn.execute(
                "INSERT INTO session_tasks(session_id, state, manual_takeover, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                params![session_id, WorkflowState::New.as_str(), now],
            )?;
        }

        let allowed = SessionStateMachine::can_transition(from_state, to_state);
        if allowed {
            conn.execute(
                "UPDATE session_tasks SET state = ?1, updated_at = ?2, last_error = NULL
                 WHERE session_id = ?3",
                params![to_state.as_str(), now, session_id],
            )?;
        }

        conn.execute(
            r#"
            INSERT INTO session_state_transitions(
                session_id, from_state, to_state, status, reason, metadata, error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                session_id,
                from_state.as_str(),
                to_state.as_str(),
                if allowed { "success" } else { "rejected" },
                reason,
                metadata_json,
                if allowed {
                    None::<String>
                } else {
                    Some("illegal_transition".into())
                },
                now,
            ],
        )?;

        if !allowed {
            conn.execute(
                "UPDATE session_tasks SET last_error = ?1, updated_at = ?2 WHERE session_id = ?3",
                params![
                    format!("illegal_transition:{from_state}->{to_state}"),
                    now,
                    session_id,
                ],
            )?;
        }
        Ok(allowed)
    }

    /// Bypass the table for operator corrections; always audited as `forced`.
    pub fn force_state(
        &self,
        session_id: &str,
        to_state: WorkflowState,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = now_ts();
        let metadata_json =
            serde_json::to_string(&metadata.unwrap_or_else(|| serde_json::json!({})))
                .unwrap_or_else(|_| "{}".into());

        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT state FROM session_tasks WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let from_state = current.clone().unwrap_or_else(|| "NEW".into());
        if current.is_none() {
            conn.execute(
                "INSERT INTO session_tasks(session_id, state, manual_takeover, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                params![session_id, WorkflowState::New.as_str(), now],
            )?;
        }

        conn.execute(
            "UPDATE session_tasks SET state = ?1, updated_at = ?2, last_error = NULL
             WHERE session_id = ?3",
            params![to_state.as_str(), now, session_id],
        )?;
        conn.execute(
            r#"
            INSERT INTO session_state_transitions(
                session_id, from_state, to_state, status, reason, metadata, error, created_at
            ) VALUES (?1, ?2, ?3, 'forced', ?4, ?5, NULL, ?6)
            "#,
            params![session_id, from_state, to_state.as_str(), reason, metadata_json, now],
        )?;
        Ok(())
    }

    pub fn get_transitions(&self, session_id: &str, limit: usize) -> Result<Vec<TransitionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, from_state, to_state, status, reason, metadata, error, created_at
             FROM session_state_transitions WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![session_id, limit.max(1) as i64], |row| {
                Ok(TransitionRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    from_state: row.get(2)?,
                    to_state: row.get(3)?,
                    status: row.get(4)?,
                    reason: row.get(5)?,
                    metadata: row.get(6)?,
                    error: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── session context ──

    pub fn get_context(&self, session_id: &str) -> Result<SessionContext> {
        let conn = self.conn.lock();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT context_json FROM session_tasks WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    /// Read-modify-write of the per-session context under the store lock.
    pub fn update_context(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut SessionContext),
    ) -> Result<SessionContext> {
        let now = now_ts();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO session_tasks(session_id, state, manual_takeover, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![session_id, WorkflowState::New.as_str(), now],
        )?;
        let raw: Option<String> = conn.query_row(
            "SELECT context_json FROM session_tasks WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let mut context: SessionContext = raw
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        mutate(&mut context);
        conn.execute(
            "UPDATE session_tasks SET context_json = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![serde_json::to_string(&context)?, now, session_id],
        )?;
        Ok(context)
    }

    // ── job queue ──

    /// Idempotent: one row per `{session}:{hash16}:{stage}`.
    pub fn enqueue_job(&self, session: &InboundSession, stage: &str) -> Result<bool> {
        if session.session_id.is_empty() {
            return Ok(false);
        }
        let hash = crate::transport::wire::sha1_hex(&session.last_message);
        let dedupe_key = format!("{}:{}:{}", session.session_id, &hash[..16], stage);
        let payload_json = serde_json::to_string(session)?;
        let now = now_ts();

        let inserted = self.conn.lock().execute(
            r#"
            INSERT OR IGNORE INTO workflow_jobs(
                dedupe_key, session_id, stage, payload_json, status, attempts,
                next_run_at, lease_until, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, NULL, NULL, ?5, ?5)
            "#,
            params![dedupe_key, session.session_id, stage, payload_json, now],
        )?;
        Ok(inserted > 0)
    }

    /// Return expired `running` leases to `pending`.
    pub fn recover_expired_jobs(&self) -> Result<usize> {
        let now = now_ts();
        let recovered = self.conn.lock().execute(
            "UPDATE workflow_jobs
             SET status = 'pending', lease_until = NULL, updated_at = ?1
             WHERE status = 'running' AND lease_until IS NOT NULL AND lease_until < ?1",
            params![now],
        )?;
        if recovered > 0 {
            debug!(recovered, "expired job leases recovered");
        }
        Ok(recovered)
    }

    /// Atomically claim up to `limit` due jobs, oldest id first.
    pub fn claim_jobs(&self, limit: usize, lease_seconds: i64) -> Result<Vec<WorkflowJob>> {
        let now = now_ts();
        let lease_until = ts_after_seconds(lease_seconds);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut jobs = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, session_id, stage, payload_json, attempts FROM workflow_jobs
                 WHERE status = 'pending' AND next_run_at <= ?1
                 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now, limit.max(1) as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (id, session_id, stage, payload_json, attempts) in rows {
                tx.execute(
                    "UPDATE workflow_jobs SET status = 'running', lease_until = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![lease_until, now, id],
                )?;
                jobs.push(WorkflowJob {
                    id,
                    session_id,
                    stage,
                    payload: serde_json::from_str(&payload_json).unwrap_or_default(),
                    attempts,
                });
            }
        }
        tx.commit()?;
        Ok(jobs)
    }

    pub fn complete_job(&self, job_id: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE workflow_jobs SET status = 'done', lease_until = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now_ts(), job_id],
        )?;
        Ok(())
    }

    /// Retry with exponential backoff; `dead` once attempts hit the cap.
    pub fn fail_job(
        &self,
        job_id: i64,
        error: &str,
        max_attempts: u32,
        base_backoff_seconds: i64,
    ) -> Result<()> {
        let now = now_ts();
        let error: String = error.chars().take(500).collect();
        let conn = self.conn.lock();
        let attempts: u32 = conn
            .query_row(
                "SELECT attempts FROM workflow_jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
            + 1;

        if attempts >= max_attempts {
            conn.execute(
                "UPDATE workflow_jobs
                 SET status = 'dead', attempts = ?1, lease_until = NULL, last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![attempts, error, now, job_id],
            )?;
            return Ok(());
        }

        let wait_seconds = base_backoff_seconds * 2_i64.pow(attempts.saturating_sub(1));
        conn.execute(
            "UPDATE workflow_jobs
             SET status = 'pending', attempts = ?1, next_run_at = ?2, lease_until = NULL,
                 last_error = ?3, updated_at = ?4
             WHERE id = ?5",
            params![attempts, ts_after_seconds(wait_seconds), error, now, job_id],
        )?;
        Ok(())
    }

    pub fn job_record(&self, job_id: i64) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, dedupe_key, session_id, status, attempts, next_run_at, lease_until, last_error
                 FROM workflow_jobs WHERE id = ?1",
                params![job_id],
                |row| {
                    Ok(JobRecord {
                        id: row.get(0)?,
                        dedupe_key: row.get(1)?,
                        session_id: row.get(2)?,
                        status: row.get(3)?,
                        attempts: row.get(4)?,
                        next_run_at: row.get(5)?,
                        lease_until: row.get(6)?,
                        last_error: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Test/recovery seam: write a job row in a given status directly.
    pub fn seed_job_status(
        &self,
        job_id: i64,
        status: &str,
        lease_until_offset_seconds: Option<i64>,
    ) -> Result<()> {
        let lease_until = lease_until_offset_seconds.map(ts_after_seconds);
        self.conn.lock().execute(
            "UPDATE workflow_jobs SET status = ?1, lease_until = ?2, updated_at = ?3 WHERE id = ?4",
            params![status, lease_until, now_ts(), job_id],
        )?;
        Ok(())
    }

    // ── SLA events & alerts ──

    pub fn record_sla_event(
        &self,
        session_id: &str,
        stage: &str,
        outcome: &str,
        latency_ms: i64,
        quote_fallback: bool,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO sla_events(session_id, stage, outcome, latency_ms, quote_fallback, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                stage,
                outcome,
                latency_ms.max(0),
                quote_fallback as i64,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn sla_summary(&self, window_minutes: i64) -> Result<SlaSummary> {
        let cutoff = format_ts(Utc::now() - ChronoDuration::minutes(window_minutes.max(1)));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT stage, outcome, latency_ms, quote_fallback FROM sla_events
             WHERE created_at >= ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let first_reply_samples: Vec<i64> = rows
            .iter()
            .filter(|(stage, ..)| stage == "reply" || stage == "quote")
            .map(|(_, _, latency, _)| *latency)
            .collect();
        let quote_rows: Vec<_> = rows.iter().filter(|(stage, ..)| stage == "quote").collect();
        let quote_success = quote_rows
            .iter()
            .filter(|(_, outcome, ..)| outcome == "success")
            .count();
        let quote_fallback = quote_rows
            .iter()
            .filter(|(_, _, _, fallback)| *fallback == 1)
            .count();

        let percentile = |samples: &[i64], p: f64| -> i64 {
            if samples.is_empty() {
                return 0;
            }
            let mut ordered = samples.to_vec();
            ordered.sort_unstable();
            let index = (((ordered.len() - 1) as f64) * p) as usize;
            ordered[index.min(ordered.len() - 1)]
        };

        let ratio = |num: usize, den: usize| -> f64 {
            if den == 0 {
                0.0
            } else {
                ((num as f64 / den as f64) * 10_000.0).round() / 10_000.0
            }
        };

        Ok(SlaSummary {
            window_minutes,
            event_count: rows.len(),
            first_reply_p50_ms: percentile(&first_reply_samples, 0.5),
            first_reply_p95_ms: percentile(&first_reply_samples, 0.95),
            quote_total: quote_rows.len(),
            quote_success_rate: ratio(quote_success, quote_rows.len()),
            quote_fallback_rate: ratio(quote_fallback, quote_rows.len()),
        })
    }

    /// Insert an active alert unless one of the same type is already active
    /// within the cooldown window.
    pub fn raise_alert_once(
        &self,
        alert_type: &str,
        title: &str,
        message: &str,
        cooldown_minutes: i64,
    ) -> Result<bool> {
        let cutoff = format_ts(Utc::now() - ChronoDuration::minutes(cooldown_minutes.max(1)));
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sla_alerts
                 WHERE alert_type = ?1 AND status = 'active' AND created_at >= ?2 LIMIT 1",
                params![alert_type, cutoff],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO sla_alerts(alert_type, title, message, status, created_at, resolved_at)
             VALUES (?1, ?2, ?3, 'active', ?4, NULL)",
            params![alert_type, title, message, now_ts()],
        )?;
        Ok(true)
    }

    pub fn active_alert_count(&self, alert_type: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sla_alerts WHERE alert_type = ?1 AND status = 'active'",
            params![alert_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sessions the follow-up pass may touch: recently replied or quoted,
    /// not under manual takeover.
    pub fn list_followup_candidates(&self, limit: usize) -> Result<Vec<SessionTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, state, manual_takeover, last_message_hash, peer_user_id,
                    last_peer_name, last_item_title, last_error, created_at, updated_at
             FROM session_tasks
             WHERE state IN ('REPLIED', 'QUOTED') AND manual_takeover = 0
             ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit.max(1) as i64], |row| {
                Ok(SessionTask {
                    session_id: row.get(0)?,
                    state: WorkflowState::parse(&row.get::<_, String>(1)?)
                        .unwrap_or(WorkflowState::New),
                    manual_takeover: row.get::<_, i64>(2)? != 0,
                    last_message_hash: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    peer_user_id: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    last_peer_name: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    last_item_title: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    last_error: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn workflow_summary(&self) -> Result<WorkflowSummary> {
        let conn = self.conn.lock();
        let mut jobs = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM workflow_jobs GROUP BY status")?;
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            jobs.insert(status, count);
        }

        let mut states = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM session_tasks GROUP BY state")?;
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (state, count) = row?;
            states.insert(state, count);
        }

        let manual: i64 = conn.query_row(
            "SELECT COUNT(*) FROM session_tasks WHERE manual_takeover = 1",
            [],
            |row| row.get(0),
        )?;

        Ok(WorkflowSummary {
            jobs,
            states,
            manual_takeover_sessions: manual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, WorkflowStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::open(dir.path().join("workflow.db")).unwrap();
        (dir, store)
    }

    fn session(id: &str, message: &str) -> InboundSession {
        InboundSession {
            session_id: id.into(),
            peer_name: "买家".into(),
            item_title: "快递服务".into(),
            last_message: message.into(),
            unread_count: 1,
            sender_user_id: "peer_1".into(),
            create_time: 0,
            source: "test".into(),
        }
    }

    #[test]
    fn ensure_session_learns_peer_and_keeps_state() {
        let (_dir, store) = store();
        store.ensure_session(&session("s1", "你好")).unwrap();
        let task = store.get_session("s1").unwrap().unwrap();
        assert_eq!(task.state, WorkflowState::New);
        assert_eq!(task.peer_user_id, "peer_1");

        store
            .transition_state("s1", WorkflowState::Replied, "test", None)
            .unwrap();
        store.ensure_session(&session("s1", "第二句")).unwrap();
        let task = store.get_session("s1").unwrap().unwrap();
        assert_eq!(task.state, WorkflowState::Replied);
    }

    #[test]
    fn illegal_transition_is_rejected_and_audited() {
        let (_dir, store) = store();
        store.ensure_session(&session("s1", "你好")).unwrap();
        let ok = store
            .transition_state("s1", WorkflowState::Ordered, "test", None)
            .unwrap();
        assert!(!ok);
        let task = store.get_session("s1").unwrap().unwrap();
        assert_eq!(task.state, WorkflowState::New);
        assert!(task.last_error.unwrap().contains("illegal_transition"));

        let transitions = store.get_transitions("s1", 10).unwrap();
        assert_eq!(transitions[0].status, "rejected");
        assert_eq!(transitions[0].error.as_deref(), Some("illegal_transition"));
    }

    #[test]
    fn forced_transition_bypasses_table() {
        let (_dir, store) = store();
        store.ensure_session(&session("s1", "你好")).unwrap();
        store
            .force_state("s1", WorkflowState::Ordered, "operator_fix", None)
            .unwrap();
        let task = store.get_session("s1").unwrap().unwrap();
        assert_eq!(task.state, WorkflowState::Ordered);
        let transitions = store.get_transitions("s1", 10).unwrap();
        assert_eq!(transitions[0].status, "forced");
    }

    #[test]
    fn enqueue_is_idempotent_per_content_hash() {
        let (_dir, store) = store();
        assert!(store.enqueue_job(&session("s1", "你好"), "reply").unwrap());
        assert!(!store.enqueue_job(&session("s1", "你好"), "reply").unwrap());
        assert!(store.enqueue_job(&session("s1", "换一句"), "reply").unwrap());
    }

    #[test]
    fn claim_marks_running_with_lease_in_id_order() {
        let (_dir, store) = store();
        store.enqueue_job(&session("s1", "a"), "reply").unwrap();
        store.enqueue_job(&session("s2", "b"), "reply").unwrap();
        let jobs = store.claim_jobs(10, 30).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].id < jobs[1].id);
        let record = store.job_record(jobs[0].id).unwrap().unwrap();
        assert_eq!(record.status, "running");
        assert!(record.lease_until.is_some());

        // Claimed jobs are not claimable again.
        assert!(store.claim_jobs(10, 30).unwrap().is_empty());
    }

    #[test]
    fn expired_lease_recovers_to_pending() {
        let (_dir, store) = store();
        store.enqueue_job(&session("s1", "a"), "reply").unwrap();
        let jobs = store.claim_jobs(1, 30).unwrap();
        let job_id = jobs[0].id;
        store.seed_job_status(job_id, "running", Some(-60)).unwrap();

        assert_eq!(store.recover_expired_jobs().unwrap(), 1);
        let record = store.job_record(job_id).unwrap().unwrap();
        assert_eq!(record.status, "pending");
        assert!(record.lease_until.is_none());

        let reclaimed = store.claim_jobs(10, 30).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job_id);
    }

    #[test]
    fn fail_job_backs_off_then_dies() {
        let (_dir, store) = store();
        store.enqueue_job(&session("s1", "a"), "reply").unwrap();
        let job_id = store.claim_jobs(1, 30).unwrap()[0].id;

        store.fail_job(job_id, "boom", 3, 2).unwrap();
        let record = store.job_record(job_id).unwrap().unwrap();
        assert_eq!(record.status, "pending");
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        store.fail_job(job_id, "boom2", 3, 2).unwrap();
        store.fail_job(job_id, "boom3", 3, 2).unwrap();
        let record = store.job_record(job_id).unwrap().unwrap();
        assert_eq!(record.status, "dead");
        assert_eq!(record.attempts, 3);
    }

    #[test]
    fn sla_summary_counts_quotes_and_percentiles() {
        let (_dir, store) = store();
        for latency in [100, 200, 300, 400] {
            store
                .record_sla_event("s1", "quote", "success", latency, false)
                .unwrap();
        }
        store
            .record_sla_event("s2", "quote", "failed", 900, true)
            .unwrap();
        let summary = store.sla_summary(60).unwrap();
        assert_eq!(summary.event_count, 5);
        assert_eq!(summary.quote_total, 5);
        assert!((summary.quote_success_rate - 0.8).abs() < 1e-9);
        assert!((summary.quote_fallback_rate - 0.2).abs() < 1e-9);
        assert!(summary.first_reply_p95_ms >= summary.first_reply_p50_ms);
    }

    #[test]
    fn alert_dedupes_within_cooldown() {
        let (_dir, store) = store();
        assert!(store
            .raise_alert_once("HIGH_FAILURE_RATE", "t", "m", 30)
            .unwrap());
        assert!(!store
            .raise_alert_once("HIGH_FAILURE_RATE", "t", "m", 30)
            .unwrap());
        assert_eq!(store.active_alert_count("HIGH_FAILURE_RATE").unwrap(), 1);
    }

    #[test]
    fn context_roundtrip_preserves_outbound_log() {
        let (_dir, store) = store();
        store
            .update_context("s1", |ctx| {
                ctx.outbound_timestamps.push(1000);
                ctx.quoted_couriers = vec!["圆通".into(), "中通".into()];
            })
            .unwrap();
        let ctx = store.get_context("s1").unwrap();
        assert_eq!(ctx.outbound_timestamps, vec![1000]);
        assert_eq!(ctx.quoted_couriers.len(), 2);
    }

    #[test]
    fn manual_takeover_parks_session() {
        let (_dir, store) = store();
        store.ensure_session(&session("s1", "你好")).unwrap();
        assert!(store.set_manual_takeover("s1", true).unwrap());
        let task = store.get_session("s1").unwrap().unwrap();
        assert!(task.manual_takeover);
        assert_eq!(task.state, WorkflowState::Manual);

        assert!(store.set_manual_takeover("s1", false).unwrap());
        let task = store.get_session("s1").unwrap().unwrap();
        assert!(!task.manual_takeover);
        assert_eq!(task.state, WorkflowState::Replied);
    }

    #[test]
    fn workflow_summary_groups_jobs_and_states() {
        let (_dir, store) = store();
        store.ensure_session(&session("s1", "你好")).unwrap();
        store.enqueue_job(&session("s1", "你好"), "reply").unwrap();
        let summary = store.workflow_summary().unwrap();
        assert_eq!(summary.jobs.get("pending"), Some(&1));
        assert_eq!(summary.states.get("NEW"), Some(&1));
        assert_eq!(summary.manual_takeover_sessions, 0);
    }
}
