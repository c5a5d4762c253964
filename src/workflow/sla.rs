//! Worker-cycle SLA monitor.
//!
//! Keeps a ring of recent cycle samples, persists the whole window to a JSON
//! file on every update (atomic rename), and evaluates threshold alerts.
//! Alert rows land in the workflow store's alert table via the worker, once
//! per cooldown period.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::config::SlaConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleCounters {
    pub processed_sessions: u64,
    pub first_reply_total: u64,
    pub first_reply_within_target: u64,
    pub quote_followup_total: u64,
    pub quote_followup_success: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSample {
    pub ts: i64,
    pub status: String,
    pub duration_seconds: f64,
    #[serde(default)]
    pub error: String,
    #[serde(flatten)]
    pub counters: CycleCounters,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SlaSummary {
    pub total_cycles: usize,
    pub success_cycles: usize,
    pub failed_cycles: usize,
    pub failure_rate: f64,
    pub cycle_duration_p50_seconds: f64,
    pub cycle_duration_p95_seconds: f64,
    pub first_reply_total: u64,
    pub first_reply_within_target: u64,
    pub first_reply_within_target_ratio: f64,
    pub quote_followup_total: u64,
    pub quote_followup_success: u64,
    pub quote_followup_success_ratio: f64,
    pub last_cycle_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlaAlert {
    pub code: &'static str,
    pub severity: &'static str,
    pub message: String,
}

fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() == 1 {
        return values[0];
    }
    let q = q.clamp(0.0, 1.0);
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let weight = pos - lo as f64;
    sorted[lo] * (1.0 - weight) + sorted[hi] * weight
}

pub struct WorkflowSlaMonitor {
    config: SlaConfig,
    path: PathBuf,
    cycles: Mutex<Vec<CycleSample>>,
}

impl WorkflowSlaMonitor {
    pub fn new(config: &SlaConfig) -> Self {
        let path = PathBuf::from(&config.metrics_path);
        let cycles = Self::load_existing(&path)
            .map(|mut cycles| {
                let window = config.window_size.max(10);
                if cycles.len() > window {
                    cycles.drain(..cycles.len() - window);
                }
                cycles
            })
            .unwrap_or_default();
        Self {
            config: config.clone(),
            path,
            cycles: Mutex::new(cycles),
        }
    }

    pub fn metrics_path(&self) -> &Path {
        &self.path
    }

    fn load_existing(path: &Path) -> Option<Vec<CycleSample>> {
        let raw = std::fs::read_to_string(path).ok()?;
        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        serde_json::from_value(value.get("cycles")?.clone()).ok()
    }

    pub fn record_cycle(
        &self,
        status: &str,
        duration_seconds: f64,
        counters: CycleCounters,
        error: &str,
    ) -> (SlaSummary, Vec<SlaAlert>) {
        if !self.config.enabled {
            return (SlaSummary::default(), Vec::new());
        }

        let sample = CycleSample {
            ts: chrono::Utc::now().timestamp(),
            status: status.to_string(),
            duration_seconds: (duration_seconds * 1000.0).round() / 1000.0,
            error: error.to_string(),
            counters,
        };

        let mut cycles = self.cycles.lock();
        cycles.push(sample);
        let window = self.config.window_size.max(10);
        if cycles.len() > window {
            let excess = cycles.len() - window;
            cycles.drain(..excess);
        }

        let summary = Self::compute_summary(&cycles);
        let alerts = self.evaluate_alerts(&summary);

        let payload = json!({
            "enabled": true,
            "window_size": window,
            "updated_at": chrono::Utc::now().timestamp(),
            "cycles": &*cycles,
            "summary": &summary,
            "alerts": &alerts,
        });
        drop(cycles);
        if let Err(e) = self.write_atomic(&payload) {
            warn!(error = %e, "sla metrics write failed");
        }

        (summary, alerts)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        if !self.config.enabled {
            return json!({"enabled": false, "summary": {}, "alerts": [], "cycles": []});
        }
        let cycles = self.cycles.lock();
        let summary = Self::compute_summary(&cycles);
        let alerts = self.evaluate_alerts(&summary);
        json!({
            "enabled": true,
            "window_size": self.config.window_size,
            "cycles": &*cycles,
            "summary": summary,
            "alerts": alerts,
        })
    }

    fn compute_summary(cycles: &[CycleSample]) -> SlaSummary {
        let total = cycles.len();
        let success = cycles.iter().filter(|c| c.status == "success").count();
        let failed = total - success;
        let durations: Vec<f64> = cycles.iter().map(|c| c.duration_seconds).collect();

        let sum = |f: fn(&CycleCounters) -> u64| -> u64 {
            cycles.iter().map(|c| f(&c.counters)).sum()
        };
        let first_reply_total = sum(|c| c.first_reply_total);
        let first_reply_within = sum(|c| c.first_reply_within_target);
        let quote_total = sum(|c| c.quote_followup_total);
        let quote_success = sum(|c| c.quote_followup_success);

        let round4 = |v: f64| (v * 10_000.0).round() / 10_000.0;
        let ratio = |num: u64, den: u64| if den == 0 { 1.0 } else { round4(num as f64 / den as f64) };

        SlaSummary {
            total_cycles: total,
            success_cycles: success,
            failed_cycles: failed,
            failure_rate: if total == 0 {
                0.0
            } else {
                round4(failed as f64 / total as f64)
            },
            cycle_duration_p50_seconds: (percentile(&durations, 0.5) * 1000.0).round() / 1000.0,
            cycle_duration_p95_seconds: (percentile(&durations, 0.95) * 1000.0).round() / 1000.0,
            first_reply_total,
            first_reply_within_target: first_reply_within,
            first_reply_within_target_ratio: ratio(first_reply_within, first_reply_total),
            quote_followup_total: quote_total,
            quote_followup_success: quote_success,
            quote_followup_success_ratio: ratio(quote_success, quote_total),
            last_cycle_at: cycles.last().map(|c| c.ts).unwrap_or(0),
        }
    }

    fn evaluate_alerts(&self, summary: &SlaSummary) -> Vec<SlaAlert> {
        let mut alerts = Vec::new();
        if summary.total_cycles < self.config.min_samples {
            return alerts;
        }

        if summary.failure_rate >= self.config.failure_rate_threshold {
            alerts.push(SlaAlert {
                code: "HIGH_FAILURE_RATE",
                severity: "high",
                message: format!(
                    "failure_rate={:.2}% >= threshold={:.2}%",
                    summary.failure_rate * 100.0,
                    self.config.failure_rate_threshold * 100.0
                ),
            });
        }

        if summary.first_reply_total >= self.config.min_samples as u64
            && summary.first_reply_within_target_ratio < self.config.first_reply_ratio_threshold
        {
            alerts.push(SlaAlert {
                code: "FIRST_REPLY_SLA_DEGRADED",
                severity: "medium",
                message: format!(
                    "first_reply_within_target_ratio={:.2}% < threshold={:.2}%",
                    summary.first_reply_within_target_ratio * 100.0,
                    self.config.first_reply_ratio_threshold * 100.0
                ),
            });
        }

        if summary.cycle_duration_p95_seconds > self.config.cycle_p95_threshold_seconds {
            alerts.push(SlaAlert {
                code: "WORKFLOW_CYCLE_SLOW",
                severity: "medium",
                message: format!(
                    "cycle_duration_p95={:.2}s > threshold={:.2}s",
                    summary.cycle_duration_p95_seconds, self.config.cycle_p95_threshold_seconds
                ),
            });
        }

        alerts
    }

    fn write_atomic(&self, payload: &serde_json::Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create sla metrics dir {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(payload)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> SlaConfig {
        SlaConfig {
            metrics_path: dir
                .path()
                .join("workflow_sla_metrics.json")
                .to_string_lossy()
                .to_string(),
            min_samples: 3,
            ..SlaConfig::default()
        }
    }

    #[test]
    fn failure_rate_alert_needs_min_samples() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = WorkflowSlaMonitor::new(&config(&dir));

        let (_, alerts) = monitor.record_cycle("failed", 1.0, CycleCounters::default(), "x");
        assert!(alerts.is_empty());
        monitor.record_cycle("failed", 1.0, CycleCounters::default(), "x");
        let (summary, alerts) =
            monitor.record_cycle("failed", 1.0, CycleCounters::default(), "x");
        assert_eq!(summary.total_cycles, 3);
        assert!((summary.failure_rate - 1.0).abs() < 1e-9);
        assert!(alerts.iter().any(|a| a.code == "HIGH_FAILURE_RATE"));
    }

    #[test]
    fn first_reply_degradation_alert() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = WorkflowSlaMonitor::new(&config(&dir));
        for _ in 0..3 {
            monitor.record_cycle(
                "success",
                0.5,
                CycleCounters {
                    processed_sessions: 2,
                    first_reply_total: 2,
                    first_reply_within_target: 0,
                    ..CycleCounters::default()
                },
                "",
            );
        }
        let snapshot = monitor.snapshot();
        let alerts = snapshot["alerts"].as_array().unwrap();
        assert!(alerts
            .iter()
            .any(|a| a["code"] == "FIRST_REPLY_SLA_DEGRADED"));
    }

    #[test]
    fn slow_cycle_alert_uses_p95() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.cycle_p95_threshold_seconds = 1.0;
        let monitor = WorkflowSlaMonitor::new(&cfg);
        for _ in 0..3 {
            monitor.record_cycle("success", 5.0, CycleCounters::default(), "");
        }
        let (summary, alerts) = monitor.record_cycle("success", 5.0, CycleCounters::default(), "");
        assert!(summary.cycle_duration_p95_seconds > 1.0);
        assert!(alerts.iter().any(|a| a.code == "WORKFLOW_CYCLE_SLOW"));
    }

    #[test]
    fn window_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let monitor = WorkflowSlaMonitor::new(&cfg);
            monitor.record_cycle("success", 0.2, CycleCounters::default(), "");
            monitor.record_cycle("failed", 0.3, CycleCounters::default(), "oops");
        }
        let monitor = WorkflowSlaMonitor::new(&cfg);
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot["cycles"].as_array().unwrap().len(), 2);
        assert_eq!(snapshot["summary"]["failed_cycles"], 1);
    }

    #[test]
    fn percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&values, 0.5) - 2.5).abs() < 1e-9);
        assert!((percentile(&values, 0.0) - 1.0).abs() < 1e-9);
        assert!((percentile(&values, 1.0) - 4.0).abs() < 1e-9);
    }
}
