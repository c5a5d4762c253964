//! Resident workflow worker.
//!
//! Each cycle: recover expired leases, scan unread sessions, enqueue jobs
//! idempotently, claim a bounded batch under leases, process each through
//! the message service, record SLA samples, and snapshot runtime state to a
//! JSON file (atomic rename). Failures back off exponentially; a stop
//! signal short-circuits any sleep.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::WorkflowConfig;
use crate::messages::service::SessionProcessor;
use crate::workflow::sla::{CycleCounters, WorkflowSlaMonitor};
use crate::workflow::state::WorkflowState;
use crate::workflow::store::WorkflowStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub recovered_jobs: usize,
    pub unread_sessions: usize,
    pub enqueued: usize,
    pub claimed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped_manual: usize,
    pub followup_eligible: usize,
    pub followup_success: usize,
    #[serde(flatten)]
    pub counters: CycleCounters,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunBounds {
    pub max_cycles: Option<u64>,
    pub max_runtime_seconds: Option<f64>,
    pub interval_override_seconds: Option<f64>,
}

pub struct WorkflowWorker {
    processor: Arc<dyn SessionProcessor>,
    store: Arc<WorkflowStore>,
    sla: Arc<WorkflowSlaMonitor>,
    config: WorkflowConfig,
    state_path: PathBuf,
    stop_flag: AtomicBool,
    stop_notify: Notify,
}

impl WorkflowWorker {
    pub fn new(
        processor: Arc<dyn SessionProcessor>,
        store: Arc<WorkflowStore>,
        config: &WorkflowConfig,
    ) -> Self {
        Self {
            processor,
            store,
            sla: Arc::new(WorkflowSlaMonitor::new(&config.sla)),
            state_path: PathBuf::from(&config.state_path),
            config: config.clone(),
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.stop_notify.notify_waiters();
    }

    pub fn sla_monitor(&self) -> Arc<WorkflowSlaMonitor> {
        Arc::clone(&self.sla)
    }

    /// True when the stop signal fired during the sleep.
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        if self.stop_flag.load(Ordering::Relaxed) {
            return true;
        }
        tokio::select! {
            _ = self.stop_notify.notified() => true,
            _ = tokio::time::sleep(duration) => self.stop_flag.load(Ordering::Relaxed),
        }
    }

    pub async fn run_once(&self, dry_run: bool) -> Result<CycleReport> {
        let mut report = CycleReport {
            recovered_jobs: self.store.recover_expired_jobs()?,
            ..CycleReport::default()
        };

        let unread = self
            .processor
            .unread_sessions(self.config.scan_limit.max(1))
            .await;
        report.unread_sessions = unread.len();
        for session in &unread {
            self.store.ensure_session(session)?;
            if self.store.enqueue_job(session, "reply")? {
                report.enqueued += 1;
            }
        }

        let claimed = self
            .store
            .claim_jobs(self.config.claim_limit.max(1), self.config.lease_seconds)?;
        report.claimed = claimed.len();

        for job in claimed {
            let task = self.store.get_session(&job.session_id)?;
            if task.map(|t| t.manual_takeover).unwrap_or(false) {
                report.skipped_manual += 1;
                self.store.complete_job(job.id)?;
                continue;
            }

            let started = Instant::now();
            let processed = self
                .processor
                .process_session(&job.payload, dry_run, "workflow_worker")
                .await;
            let latency_ms = started.elapsed().as_millis() as i64;

            match processed {
                Ok(outcome) if outcome.sent => {
                    let next_state = if outcome.is_order_intent {
                        WorkflowState::Ordered
                    } else if outcome.is_quote && outcome.quote_success {
                        WorkflowState::Quoted
                    } else {
                        WorkflowState::Replied
                    };
                    self.store.transition_state(
                        &job.session_id,
                        next_state,
                        "workflow_worker",
                        Some(json!({
                            "quote": outcome.is_quote,
                            "quote_success": outcome.quote_success,
                            "order": outcome.is_order_intent,
                        })),
                    )?;

                    let stage = if outcome.is_quote { "quote" } else { "reply" };
                    let sla_outcome = if !outcome.is_quote || outcome.quote_success {
                        "success"
                    } else {
                        "failed"
                    };
                    self.store.record_sla_event(
                        &job.session_id,
                        stage,
                        sla_outcome,
                        latency_ms,
                        outcome.quote_fallback,
                    )?;

                    report.counters.processed_sessions += 1;
                    report.counters.first_reply_total += 1;
                    if latency_ms as f64 / 1000.0 <= self.config.sla.first_reply_target_seconds {
                        report.counters.first_reply_within_target += 1;
                    }
                    if outcome.is_quote && !outcome.quote_need_info {
                        report.counters.quote_followup_total += 1;
                        if outcome.quote_success {
                            report.counters.quote_followup_success += 1;
                        }
                    }

                    self.store.complete_job(job.id)?;
                    report.success += 1;
                }
                Ok(outcome) => {
                    let reason = outcome
                        .block_reason
                        .unwrap_or_else(|| "reply_not_sent".into());
                    self.store.fail_job(
                        job.id,
                        &reason,
                        self.config.max_attempts,
                        self.config.backoff_seconds,
                    )?;
                    report.failed += 1;
                }
                Err(e) => {
                    self.store.fail_job(
                        job.id,
                        &e.to_string(),
                        self.config.max_attempts,
                        self.config.backoff_seconds,
                    )?;
                    report.failed += 1;
                }
            }
        }

        let followup = self
            .processor
            .followup_pass(self.config.scan_limit.max(1), dry_run)
            .await;
        report.followup_eligible = followup.eligible;
        report.followup_success = followup.success;

        Ok(report)
    }

    fn write_state(&self, state: &serde_json::Value) {
        let write = || -> Result<()> {
            if let Some(parent) = self.state_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create state dir {}", parent.display()))?;
            }
            let tmp = self.state_path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
            std::fs::rename(&tmp, &self.state_path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(error = %e, "worker state write failed");
        }
    }

    fn record_alerts(&self, alerts: &[crate::workflow::sla::SlaAlert]) {
        for alert in alerts {
            match self.store.raise_alert_once(
                alert.code,
                alert.code,
                &alert.message,
                self.config.sla.alert_cooldown_minutes,
            ) {
                Ok(true) => warn!(code = alert.code, message = %alert.message, "SLA alert raised"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "alert write failed"),
            }
        }
    }

    /// Main loop. Returns a run summary once stopped or a bound is hit.
    pub async fn run(&self, dry_run: bool, bounds: RunBounds) -> serde_json::Value {
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        let interval = Duration::from_secs_f64(
            bounds
                .interval_override_seconds
                .unwrap_or(self.config.interval_seconds)
                .max(0.01),
        );

        let mut cycles_total: u64 = 0;
        let mut cycles_success: u64 = 0;
        let mut cycles_failed: u64 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut last_error = String::new();
        let mut latest_alerts: Vec<serde_json::Value> = Vec::new();

        info!(
            dry_run,
            interval_seconds = interval.as_secs_f64(),
            max_cycles = ?bounds.max_cycles,
            "workflow worker started"
        );

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }
            if let Some(max_cycles) = bounds.max_cycles {
                if cycles_total >= max_cycles {
                    break;
                }
            }
            if let Some(max_runtime) = bounds.max_runtime_seconds {
                if started.elapsed().as_secs_f64() >= max_runtime {
                    break;
                }
            }

            cycles_total += 1;
            let cycle_started = Instant::now();
            let cycle_wall_start = chrono::Utc::now().timestamp();

            match self.run_once(dry_run).await {
                Ok(report) => {
                    cycles_success += 1;
                    consecutive_failures = 0;
                    last_error.clear();

                    let duration = cycle_started.elapsed().as_secs_f64();
                    let (_, alerts) =
                        self.sla
                            .record_cycle("success", duration, report.counters.clone(), "");
                    self.record_alerts(&alerts);
                    latest_alerts = alerts
                        .iter()
                        .map(|a| serde_json::to_value(a).unwrap_or_default())
                        .collect();

                    self.write_state(&json!({
                        "status": "running",
                        "last_cycle_status": "success",
                        "last_cycle_at": cycle_wall_start,
                        "cycles_total": cycles_total,
                        "cycles_success": cycles_success,
                        "cycles_failed": cycles_failed,
                        "last_error": "",
                        "last_cycle": report,
                        "alerts": latest_alerts,
                        "updated_at": chrono::Utc::now().timestamp(),
                    }));

                    if let Some(max_cycles) = bounds.max_cycles {
                        if cycles_total >= max_cycles {
                            break;
                        }
                    }
                    let jitter = if self.config.jitter_seconds > 0.0 {
                        rand::thread_rng().gen_range(0.0..self.config.jitter_seconds)
                    } else {
                        0.0
                    };
                    if self
                        .sleep_or_stop(interval + Duration::from_secs_f64(jitter))
                        .await
                    {
                        break;
                    }
                }
                Err(e) => {
                    cycles_failed += 1;
                    consecutive_failures += 1;
                    last_error = e.to_string();
                    error!(error = %last_error, "workflow worker cycle failed");

                    let duration = cycle_started.elapsed().as_secs_f64();
                    let (_, alerts) = self.sla.record_cycle(
                        "failed",
                        duration,
                        CycleCounters::default(),
                        &last_error,
                    );
                    self.record_alerts(&alerts);
                    latest_alerts = alerts
                        .iter()
                        .map(|a| serde_json::to_value(a).unwrap_or_default())
                        .collect();

                    self.write_state(&json!({
                        "status": "running",
                        "last_cycle_status": "failed",
                        "last_cycle_at": cycle_wall_start,
                        "cycles_total": cycles_total,
                        "cycles_success": cycles_success,
                        "cycles_failed": cycles_failed,
                        "last_error": last_error,
                        "alerts": latest_alerts,
                        "updated_at": chrono::Utc::now().timestamp(),
                    }));

                    if let Some(max_cycles) = bounds.max_cycles {
                        if cycles_total >= max_cycles {
                            break;
                        }
                    }
                    let backoff = (self.config.worker_backoff_seconds
                        * 2_f64.powi(consecutive_failures.saturating_sub(1) as i32))
                    .min(self.config.worker_max_backoff_seconds);
                    if self.sleep_or_stop(Duration::from_secs_f64(backoff)).await {
                        break;
                    }
                }
            }
        }

        let stopped_at = chrono::Utc::now();
        self.write_state(&json!({
            "status": "stopped",
            "started_at": started_at.timestamp(),
            "stopped_at": stopped_at.timestamp(),
            "cycles_total": cycles_total,
            "cycles_success": cycles_success,
            "cycles_failed": cycles_failed,
            "last_error": last_error,
            "alerts": latest_alerts,
            "updated_at": stopped_at.timestamp(),
        }));

        json!({
            "action": "run_worker",
            "started_at": started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            "stopped_at": stopped_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            "duration_seconds": started.elapsed().as_secs_f64(),
            "cycles_total": cycles_total,
            "cycles_success": cycles_success,
            "cycles_failed": cycles_failed,
            "last_error": last_error,
            "dry_run": dry_run,
            "state_path": self.state_path.display().to_string(),
            "alerts": latest_alerts,
            "sla_summary": self.sla.snapshot()["summary"].clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::service::{FollowupReport, ProcessOutcome};
    use crate::transport::InboundSession;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct StubProcessor {
        sessions: Mutex<Vec<InboundSession>>,
        outcome: ProcessOutcome,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl SessionProcessor for StubProcessor {
        async fn unread_sessions(&self, _limit: usize) -> Vec<InboundSession> {
            std::mem::take(&mut *self.sessions.lock())
        }

        async fn process_session(
            &self,
            session: &InboundSession,
            _dry_run: bool,
            _actor: &str,
        ) -> anyhow::Result<ProcessOutcome> {
            if let Some(error) = &self.fail_with {
                anyhow::bail!("{error}");
            }
            let mut outcome = self.outcome.clone();
            outcome.session_id = session.session_id.clone();
            Ok(outcome)
        }

        async fn followup_pass(&self, _limit: usize, _dry_run: bool) -> FollowupReport {
            FollowupReport::default()
        }
    }

    fn session(id: &str, message: &str) -> InboundSession {
        InboundSession {
            session_id: id.into(),
            peer_name: "买家".into(),
            item_title: String::new(),
            last_message: message.into(),
            unread_count: 1,
            sender_user_id: "peer".into(),
            create_time: 0,
            source: "test".into(),
        }
    }

    fn worker_with(
        dir: &tempfile::TempDir,
        sessions: Vec<InboundSession>,
        outcome: ProcessOutcome,
        fail_with: Option<String>,
    ) -> (Arc<WorkflowStore>, WorkflowWorker) {
        let store = Arc::new(WorkflowStore::open(dir.path().join("workflow.db")).unwrap());
        let mut config = WorkflowConfig::default();
        config.state_path = dir
            .path()
            .join("workflow_worker_state.json")
            .to_string_lossy()
            .to_string();
        config.sla.metrics_path = dir
            .path()
            .join("workflow_sla_metrics.json")
            .to_string_lossy()
            .to_string();
        let processor = Arc::new(StubProcessor {
            sessions: Mutex::new(sessions),
            outcome,
            fail_with,
        });
        let worker = WorkflowWorker::new(processor, Arc::clone(&store), &config);
        (store, worker)
    }

    fn sent_quote_outcome() -> ProcessOutcome {
        ProcessOutcome {
            sent: true,
            is_quote: true,
            quote_success: true,
            ..ProcessOutcome::default()
        }
    }

    #[tokio::test]
    async fn run_once_enqueues_claims_and_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (store, worker) = worker_with(
            &dir,
            vec![session("s1", "从上海寄到杭州 2kg 多少钱")],
            sent_quote_outcome(),
            None,
        );

        let report = worker.run_once(true).await.unwrap();
        assert_eq!(report.unread_sessions, 1);
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.claimed, 1);
        assert_eq!(report.success, 1);

        let task = store.get_session("s1").unwrap().unwrap();
        assert_eq!(task.state, WorkflowState::Quoted);
        let summary = store.sla_summary(60).unwrap();
        assert_eq!(summary.quote_total, 1);
        assert!((summary.quote_success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn manual_takeover_sessions_are_skipped_and_completed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, worker) = worker_with(
            &dir,
            vec![session("s1", "你好")],
            sent_quote_outcome(),
            None,
        );
        store.ensure_session(&session("s1", "你好")).unwrap();
        store.set_manual_takeover("s1", true).unwrap();

        let report = worker.run_once(true).await.unwrap();
        assert_eq!(report.skipped_manual, 1);
        assert_eq!(report.success, 0);
        // The job is completed, not retried.
        let summary = store.workflow_summary().unwrap();
        assert_eq!(summary.jobs.get("done"), Some(&1));
    }

    #[tokio::test]
    async fn processing_error_fails_job_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let (store, worker) = worker_with(
            &dir,
            vec![session("s1", "你好")],
            ProcessOutcome::default(),
            Some("transport exploded".into()),
        );

        let report = worker.run_once(true).await.unwrap();
        assert_eq!(report.failed, 1);
        let summary = store.workflow_summary().unwrap();
        assert_eq!(summary.jobs.get("pending"), Some(&1));
    }

    #[tokio::test]
    async fn unsent_outcome_records_block_reason_on_job() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ProcessOutcome {
            sent: false,
            block_reason: Some("min_interval_not_met".into()),
            ..ProcessOutcome::default()
        };
        let (store, worker) = worker_with(&dir, vec![session("s1", "你好")], outcome, None);

        worker.run_once(true).await.unwrap();
        let claimed_after = store.claim_jobs(10, 30).unwrap();
        // Backoff pushed next_run_at into the future.
        assert!(claimed_after.is_empty());
    }

    #[tokio::test]
    async fn run_with_max_cycles_writes_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, worker) = worker_with(&dir, vec![], sent_quote_outcome(), None);
        let summary = worker
            .run(
                true,
                RunBounds {
                    max_cycles: Some(2),
                    interval_override_seconds: Some(0.01),
                    ..RunBounds::default()
                },
            )
            .await;
        assert_eq!(summary["cycles_total"], 2);
        let raw = std::fs::read_to_string(dir.path().join("workflow_worker_state.json")).unwrap();
        let state: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(state["status"], "stopped");
        assert_eq!(state["cycles_total"], 2);
    }

    #[tokio::test]
    async fn order_intent_transitions_to_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ProcessOutcome {
            sent: true,
            is_order_intent: true,
            ..ProcessOutcome::default()
        };
        let (store, worker) = worker_with(&dir, vec![session("s1", "已付款")], outcome, None);
        // Session progressed to QUOTED earlier in its life.
        store.ensure_session(&session("s1", "已付款")).unwrap();
        store
            .transition_state("s1", WorkflowState::Quoted, "test", None)
            .unwrap();

        worker.run_once(true).await.unwrap();
        let task = store.get_session("s1").unwrap().unwrap();
        assert_eq!(task.state, WorkflowState::Ordered);
    }
}
