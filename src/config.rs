//! Application configuration.
//!
//! Loaded from `config/config.yaml` (falling back to
//! `config/config.example.yaml`), every section optional with typed defaults.
//! A handful of environment variables override the file: `XIANYU_COOKIE_1`
//! (session cookie), `OPENCLAW_RUNTIME` (auto|lite|pro), and the data
//! directory via `IDLEBOT_DATA_DIR`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

const CONFIG_SEARCH_PATHS: &[&str] = &["config/config.yaml", "config/config.example.yaml"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: DataDir,
    pub runtime: RuntimeMode,
    pub browser: BrowserConfig,
    pub messages: MessagesConfig,
    pub quote: QuoteConfig,
    pub compliance: ComplianceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataDir(pub String);

impl Default for DataDir {
    fn default() -> Self {
        Self("data".into())
    }
}

/// Browser runtime resolution: `pro` requires the gateway, `lite` runs the
/// WS-only paths, `auto` accepts whichever is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    #[default]
    Auto,
    Lite,
    Pro,
}

impl RuntimeMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "lite" => Some(Self::Lite),
            "pro" => Some(Self::Pro),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Lite => "lite",
            Self::Pro => "pro",
        }
    }
}

/// Browser gateway (DOM transport + listing collaborator) connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub host: String,
    pub gateway_port: u16,
    pub profile: String,
    pub token: String,
    pub timeout_seconds: u64,
    pub retry_times: u32,
    pub delay_min_seconds: f64,
    pub delay_max_seconds: f64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            gateway_port: 7902,
            profile: "openclaw".into(),
            token: String::new(),
            timeout_seconds: 30,
            retry_times: 2,
            delay_min_seconds: 1.0,
            delay_max_seconds: 3.0,
        }
    }
}

impl BrowserConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.gateway_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Auto,
    Ws,
    Dom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub transport: TransportMode,
    /// Session cookie; `XIANYU_COOKIE_1` takes priority when set.
    pub cookie: String,
    pub account_id: String,
    pub default_reply: String,
    pub reply_prefix: String,
    /// Extra keyword templates merged over the built-in table.
    pub keyword_replies: BTreeMap<String, String>,
    pub force_non_empty_reply: bool,
    pub non_empty_reply_fallback: String,
    pub strict_format_reply_enabled: bool,
    pub context_memory_enabled: bool,
    pub quote_reply_all_couriers: bool,
    pub quote_reply_template: Option<String>,
    pub max_replies_per_run: usize,
    pub fulfillment: FulfillmentConfig,
    pub outbound: OutboundConfig,
    pub followup: FollowupConfig,
    pub ws: WsConfig,
    pub workflow: WorkflowConfig,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::Auto,
            cookie: String::new(),
            account_id: "default".into(),
            default_reply: "您好，宝贝在的，感兴趣可以直接拍下。".into(),
            reply_prefix: String::new(),
            keyword_replies: BTreeMap::new(),
            force_non_empty_reply: true,
            non_empty_reply_fallback: String::new(),
            strict_format_reply_enabled: false,
            context_memory_enabled: true,
            quote_reply_all_couriers: true,
            quote_reply_template: None,
            max_replies_per_run: 10,
            fulfillment: FulfillmentConfig::default(),
            outbound: OutboundConfig::default(),
            followup: FollowupConfig::default(),
            ws: WsConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl MessagesConfig {
    /// Env cookie wins over the config file value.
    pub fn resolve_cookie(&self) -> String {
        match std::env::var("XIANYU_COOKIE_1") {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => self.cookie.trim().to_string(),
        }
    }
}

/// Order-confirmation detection and ack reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FulfillmentConfig {
    pub enabled: bool,
    pub order_intent_keywords: Vec<String>,
    pub ack_template: String,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            order_intent_keywords: Vec::new(),
            ack_template: String::new(),
        }
    }
}

/// Outbound cooldown policy per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub enabled: bool,
    pub min_interval_seconds: u64,
    pub max_per_session_hour: usize,
    pub max_per_session_day: usize,
    pub block_keywords: Vec<String>,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_seconds: 1,
            max_per_session_hour: 6,
            max_per_session_day: 20,
            block_keywords: Vec::new(),
        }
    }
}

/// Read-no-reply follow-up policy. Off unless explicitly enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowupConfig {
    pub enabled: bool,
    pub min_elapsed_seconds: u64,
    pub min_interval_seconds: u64,
    pub max_per_session: usize,
    pub templates: Vec<String>,
    pub stop_keywords: Vec<String>,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_elapsed_seconds: 300,
            min_interval_seconds: 1800,
            max_per_session: 1,
            templates: Vec::new(),
            stop_keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub base_url: String,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub reconnect_delay_seconds: f64,
    pub max_backoff_seconds: f64,
    pub message_expire_ms: u64,
    pub max_queue_size: usize,
    pub queue_wait_seconds: f64,
    pub token_refresh_interval_seconds: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://wss-goofish.dingtalk.com/".into(),
            heartbeat_interval_seconds: 15,
            heartbeat_timeout_seconds: 5,
            reconnect_delay_seconds: 3.0,
            max_backoff_seconds: 60.0,
            message_expire_ms: 5 * 60 * 1000,
            max_queue_size: 200,
            queue_wait_seconds: 0.3,
            token_refresh_interval_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub db_path: String,
    pub scan_limit: usize,
    pub claim_limit: usize,
    pub lease_seconds: i64,
    pub max_attempts: u32,
    pub backoff_seconds: i64,
    pub interval_seconds: f64,
    pub jitter_seconds: f64,
    pub worker_backoff_seconds: f64,
    pub worker_max_backoff_seconds: f64,
    pub state_path: String,
    pub sla: SlaConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            db_path: "data/workflow.db".into(),
            scan_limit: 20,
            claim_limit: 10,
            lease_seconds: 60,
            max_attempts: 3,
            backoff_seconds: 2,
            interval_seconds: 15.0,
            jitter_seconds: 1.5,
            worker_backoff_seconds: 5.0,
            worker_max_backoff_seconds: 120.0,
            state_path: "data/workflow_worker_state.json".into(),
            sla: SlaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    pub enabled: bool,
    pub metrics_path: String,
    pub window_size: usize,
    pub min_samples: usize,
    pub failure_rate_threshold: f64,
    pub first_reply_ratio_threshold: f64,
    pub cycle_p95_threshold_seconds: f64,
    pub first_reply_target_seconds: f64,
    pub alert_cooldown_minutes: i64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_path: "data/workflow_sla_metrics.json".into(),
            window_size: 500,
            min_samples: 10,
            failure_rate_threshold: 0.2,
            first_reply_ratio_threshold: 0.7,
            cycle_p95_threshold_seconds: 20.0,
            first_reply_target_seconds: 60.0,
            alert_cooldown_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuoteMode {
    #[default]
    RuleOnly,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteConfig {
    pub enabled: bool,
    pub mode: QuoteMode,
    pub timeout_ms: u64,
    pub retry_times: u32,
    pub safety_margin: f64,
    pub validity_minutes: u32,
    pub ttl_seconds: u64,
    pub max_stale_seconds: u64,
    pub hot_cache_ttl_seconds: u64,
    pub circuit_fail_threshold: u32,
    pub circuit_open_seconds: u64,
    pub origin_city: String,
    pub preferred_couriers: Vec<String>,
    pub cost_table_dir: String,
    pub volume_divisor: f64,
    pub snapshot_db_path: String,
    pub remote: RemoteProviderConfig,
    pub engine_version: String,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: QuoteMode::RuleOnly,
            timeout_ms: 3000,
            retry_times: 1,
            safety_margin: 0.0,
            validity_minutes: 30,
            ttl_seconds: 90,
            max_stale_seconds: 300,
            hot_cache_ttl_seconds: 300,
            circuit_fail_threshold: 3,
            circuit_open_seconds: 30,
            origin_city: "杭州".into(),
            preferred_couriers: vec![
                "圆通".into(),
                "中通".into(),
                "韵达".into(),
                "顺丰".into(),
            ],
            cost_table_dir: "data/cost_tables".into(),
            volume_divisor: 6000.0,
            snapshot_db_path: "data/quote_snapshots.db".into(),
            remote: RemoteProviderConfig::default(),
            engine_version: "v2.0".into(),
        }
    }
}

/// Mock remote tariff provider used by hybrid mode; failure injection keeps
/// the circuit-breaker path testable offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteProviderConfig {
    pub enabled: bool,
    pub simulated_latency_ms: u64,
    pub failure_rate: f64,
}

impl Default for RemoteProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            simulated_latency_ms: 120,
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub policy_path: String,
    pub db_path: String,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            policy_path: "config/compliance_policies.yaml".into(),
            db_path: "data/compliance.db".into(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit path, or the first file found on the default
    /// search path. Missing file yields the built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self, AppError> {
        let candidate = match path {
            Some(p) => Some(p.to_string()),
            None => CONFIG_SEARCH_PATHS
                .iter()
                .find(|p| Path::new(p).exists())
                .map(|p| p.to_string()),
        };

        let mut config = match candidate {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .map_err(|e| AppError::config(format!("failed to read {p}: {e}")))?;
                serde_yaml::from_str::<AppConfig>(&raw)
                    .map_err(|e| AppError::config(format!("invalid YAML in {p}: {e}")))?
            }
            None => AppConfig::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("OPENCLAW_RUNTIME") {
            if let Some(mode) = RuntimeMode::parse(&raw) {
                self.runtime = mode;
            }
        }
        if let Ok(dir) = std::env::var("IDLEBOT_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.rebase_data_dir(dir.trim());
            }
        }
    }

    fn rebase_data_dir(&mut self, dir: &str) {
        let old = self.data_dir.0.clone();
        let swap = |p: &mut String| {
            if let Some(rest) = p.strip_prefix(&format!("{old}/")) {
                *p = format!("{dir}/{rest}");
            }
        };
        swap(&mut self.messages.workflow.db_path);
        swap(&mut self.messages.workflow.state_path);
        swap(&mut self.messages.workflow.sla.metrics_path);
        swap(&mut self.quote.snapshot_db_path);
        swap(&mut self.quote.cost_table_dir);
        swap(&mut self.compliance.db_path);
        self.data_dir = DataDir(dir.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.messages.outbound.max_per_session_hour, 6);
        assert_eq!(cfg.quote.ttl_seconds, 90);
        assert_eq!(cfg.messages.ws.message_expire_ms, 300_000);
        assert_eq!(cfg.messages.workflow.sla.window_size, 500);
    }

    #[test]
    fn partial_yaml_fills_missing_sections_with_defaults() {
        let raw = r#"
messages:
  transport: ws
  strict_format_reply_enabled: true
quote:
  mode: hybrid
  safety_margin: 0.05
"#;
        let cfg: AppConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(cfg.messages.transport, TransportMode::Ws);
        assert!(cfg.messages.strict_format_reply_enabled);
        assert_eq!(cfg.quote.mode, QuoteMode::Hybrid);
        assert!((cfg.quote.safety_margin - 0.05).abs() < 1e-9);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.messages.workflow.claim_limit, 10);
        assert_eq!(cfg.browser.gateway_port, 7902);
    }

    #[test]
    fn rebase_data_dir_rewrites_known_paths() {
        let mut cfg = AppConfig::default();
        cfg.rebase_data_dir("/tmp/idlebot");
        assert_eq!(cfg.messages.workflow.db_path, "/tmp/idlebot/workflow.db");
        assert_eq!(cfg.quote.snapshot_db_path, "/tmp/idlebot/quote_snapshots.db");
        assert_eq!(cfg.compliance.db_path, "/tmp/idlebot/compliance.db");
    }
}
