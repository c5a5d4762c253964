//! Auto-quote engine: multi-source fallback, two cache tiers, circuit
//! breaking, and per-quote snapshots.
//!
//! Source precedence: api -> hot_cache -> cost_table -> fallback_template.
//! The engine never raises once a request passes validation; every failure
//! degrades down the chain and the terminating error lands in
//! `snapshot.fallback_reason`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{QuoteConfig, QuoteMode};
use crate::errors::AppError;
use crate::quote::cache::{CacheLookup, QuoteCache};
use crate::quote::cost_table::CostTableRepository;
use crate::quote::models::{QuoteRequest, QuoteResult, QuoteSnapshot};
use crate::quote::providers::{QuoteProvider, RemoteQuoteProvider, RuleTableQuoteProvider};
use crate::quote::route::normalize_request_route;
use crate::quote::snapshot::QuoteSnapshotStore;

const PRICING_RULE_VERSION: &str = "v1.2";

#[derive(Debug, Default)]
struct CircuitBreakerState {
    failures: u32,
    open_until: Option<Instant>,
    half_open: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitStatus {
    pub failures: u32,
    pub open: bool,
    pub half_open: bool,
}

struct EngineCore {
    enabled: bool,
    mode: QuoteMode,
    timeout_ms: u64,
    retry_times: u32,
    safety_margin: f64,
    validity_minutes: u32,
    circuit_fail_threshold: u32,
    circuit_open: Duration,
    hot_cache_ttl: Duration,
    version: String,

    rule_provider: RuleTableQuoteProvider,
    remote_provider: RemoteQuoteProvider,

    cache: QuoteCache,
    hot_cache: Mutex<HashMap<String, (QuoteResult, Instant)>>,
    circuits: Mutex<HashMap<&'static str, CircuitBreakerState>>,

    snapshot_store: Arc<QuoteSnapshotStore>,
}

pub struct AutoQuoteEngine {
    core: Arc<EngineCore>,
    top_routes: Mutex<Vec<(String, String)>>,
}

impl AutoQuoteEngine {
    pub fn new(
        config: &QuoteConfig,
        cost_table: Arc<CostTableRepository>,
    ) -> anyhow::Result<Self> {
        let core = EngineCore {
            enabled: config.enabled,
            mode: config.mode,
            timeout_ms: config.timeout_ms,
            retry_times: config.retry_times.max(1),
            safety_margin: config.safety_margin,
            validity_minutes: config.validity_minutes,
            circuit_fail_threshold: config.circuit_fail_threshold.max(1),
            circuit_open: Duration::from_secs(config.circuit_open_seconds),
            hot_cache_ttl: Duration::from_secs(config.hot_cache_ttl_seconds),
            version: config.engine_version.clone(),
            rule_provider: RuleTableQuoteProvider::new(cost_table, config),
            remote_provider: RemoteQuoteProvider::new(&config.remote),
            cache: QuoteCache::new(config.ttl_seconds, config.max_stale_seconds),
            hot_cache: Mutex::new(HashMap::new()),
            circuits: Mutex::new(HashMap::new()),
            snapshot_store: Arc::new(QuoteSnapshotStore::open(&config.snapshot_db_path)?),
        };
        Ok(Self {
            core: Arc::new(core),
            top_routes: Mutex::new(Vec::new()),
        })
    }

    pub fn validity_minutes(&self) -> u32 {
        self.core.validity_minutes
    }

    pub async fn get_quote(&self, request: &QuoteRequest) -> Result<QuoteResult, AppError> {
        if !self.core.enabled {
            return Err(AppError::quote("Quote engine is disabled"));
        }

        let normalized = normalize_request_route(request);
        let key = normalized.cache_key();

        if let Some(mut hot) = self.core.get_hot_cache(&key) {
            hot.cache_hit = true;
            return Ok(hot);
        }

        match self.core.cache.get(&key) {
            CacheLookup::Fresh(result) => return Ok(result),
            CacheLookup::Stale(result) => {
                let core = Arc::clone(&self.core);
                let refresh_request = normalized.clone();
                let refresh_key = key.clone();
                tokio::spawn(async move {
                    core.refresh_in_background(refresh_request, refresh_key).await;
                });
                return Ok(result);
            }
            CacheLookup::Miss => {}
        }

        Ok(self.core.compute_and_store(&normalized, &key).await)
    }

    pub fn set_top_routes(&self, routes: Vec<(String, String)>) {
        let mut top = self.top_routes.lock();
        *top = routes.into_iter().take(50).collect();
    }

    /// Warm both tiers for the top routes. Failures log and continue.
    pub async fn prewarm_cache(&self, routes: Option<Vec<(String, String)>>) -> usize {
        let routes = routes.unwrap_or_else(|| self.top_routes.lock().clone());
        let mut warmed = 0;
        for (origin, destination) in routes.into_iter().take(20) {
            let request = QuoteRequest::new(origin.clone(), destination.clone(), 1.0);
            match self.get_quote(&request).await {
                Ok(_) => warmed += 1,
                Err(e) => {
                    warn!(origin = %origin, destination = %destination, error = %e, "prewarm failed")
                }
            }
        }
        info!(warmed, "quote cache prewarmed");
        warmed
    }

    pub async fn health_check(&self) -> serde_json::Value {
        json!({
            "rule_provider": self.core.rule_provider.health_check().await,
            "remote_provider": self.core.remote_provider.health_check().await,
            "circuit_breaker": self.core.circuit_status("remote"),
            "hot_cache_size": self.core.hot_cache.lock().len(),
            "primary_cache_size": self.core.cache.len(),
            "engine_version": self.core.version,
        })
    }

    pub fn snapshot_store(&self) -> Arc<QuoteSnapshotStore> {
        Arc::clone(&self.core.snapshot_store)
    }
}

impl EngineCore {
    /// Full miss path: consult sources, post-process, write both cache
    /// tiers and the snapshot store.
    async fn compute_and_store(&self, normalized: &QuoteRequest, key: &str) -> QuoteResult {
        let start = Instant::now();
        let mut result = self.quote_multi_source(normalized, key).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        result.total_fee =
            ((result.total_fee * (1.0 + self.safety_margin)) * 100.0).round() / 100.0;
        result
            .explain
            .insert("normalized_origin".into(), normalized.origin.clone().into());
        result.explain.insert(
            "normalized_destination".into(),
            normalized.destination.clone().into(),
        );
        result
            .explain
            .insert("courier".into(), normalized.courier.clone().into());
        result
            .explain
            .insert("engine_version".into(), self.version.clone().into());
        if let Some(snapshot) = result.snapshot.as_mut() {
            snapshot.latency_ms = latency_ms;
        }

        self.cache.set(key, result.clone());
        self.set_hot_cache(key, result.clone());
        if let Err(e) = self.snapshot_store.save(key, &result) {
            warn!(error = %e, "quote snapshot save failed");
        }
        debug!(
            provider = %result.provider,
            total_fee = result.total_fee,
            fallback = result.fallback_used,
            latency_ms,
            "quote computed"
        );
        result
    }

    async fn refresh_in_background(self: Arc<Self>, request: QuoteRequest, key: String) {
        let _ = self.compute_and_store(&request, &key).await;
        debug!(key = %key, "stale quote refreshed in background");
    }

    fn get_hot_cache(&self, key: &str) -> Option<QuoteResult> {
        let mut hot = self.hot_cache.lock();
        match hot.get(key) {
            Some((_, expires_at)) if *expires_at < Instant::now() => {
                hot.remove(key);
                None
            }
            Some((result, _)) => Some(result.clone()),
            None => None,
        }
    }

    fn set_hot_cache(&self, key: &str, result: QuoteResult) {
        self.hot_cache
            .lock()
            .insert(key.to_string(), (result, Instant::now() + self.hot_cache_ttl));
    }

    async fn quote_multi_source(&self, request: &QuoteRequest, key: &str) -> QuoteResult {
        if self.mode == QuoteMode::RuleOnly {
            return match self.rule_provider.get_quote(request, self.timeout_ms).await {
                Ok(mut result) => {
                    result.snapshot =
                        Some(self.table_snapshot(&result, vec!["cost_table".into()], ""));
                    result
                }
                Err(rule_err) => self.fallback_template_quote(
                    request,
                    vec!["cost_table".into(), "fallback_template".into()],
                    None,
                    Some(rule_err),
                ),
            };
        }

        // hybrid: half-open probing first.
        self.maybe_enter_half_open("remote");

        if self.is_half_open("remote") {
            return match self.remote_provider.get_quote(request, self.timeout_ms).await {
                Ok(mut result) => {
                    self.record_success("remote");
                    result.snapshot = Some(self.api_snapshot());
                    result
                }
                Err(e) => {
                    self.record_failure("remote");
                    self.fallback_chain(request, key, Some(e)).await
                }
            };
        }

        if self.is_open("remote") {
            return self
                .fallback_chain(request, key, Some(AppError::quote("circuit_open")))
                .await;
        }

        let mut remote_error: Option<AppError> = None;
        for _ in 0..self.retry_times {
            match self.remote_provider.get_quote(request, self.timeout_ms).await {
                Ok(mut result) => {
                    self.record_success("remote");
                    result.snapshot = Some(self.api_snapshot());
                    return result;
                }
                Err(e) => {
                    self.record_failure("remote");
                    remote_error = Some(e);
                }
            }
        }

        self.fallback_chain(request, key, remote_error).await
    }

    async fn fallback_chain(
        &self,
        request: &QuoteRequest,
        key: &str,
        remote_error: Option<AppError>,
    ) -> QuoteResult {
        let mut provider_chain = vec!["hot_cache_miss".to_string()];
        let reason = remote_error
            .as_ref()
            .map(|e| match e {
                AppError::QuoteProvider(msg) => msg.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "api_unavailable".to_string());

        if let Some(mut hot) = self.get_hot_cache(key) {
            hot.fallback_used = true;
            let mut chain = provider_chain.clone();
            chain.push("hot_cache".to_string());
            hot.snapshot = Some(QuoteSnapshot {
                cost_source: "hot_cache".into(),
                cost_version: "cached".into(),
                pricing_rule_version: PRICING_RULE_VERSION.into(),
                latency_ms: 0,
                provider_chain: chain,
                fallback_reason: reason,
            });
            return hot;
        }

        provider_chain.push("cost_table".to_string());
        match self.rule_provider.get_quote(request, self.timeout_ms).await {
            Ok(mut result) => {
                result.fallback_used = true;
                let snapshot = self.table_snapshot(&result, provider_chain, &reason);
                result.snapshot = Some(snapshot);
                result
            }
            Err(rule_err) => {
                provider_chain.push("fallback_template".to_string());
                self.fallback_template_quote(request, provider_chain, remote_error, Some(rule_err))
            }
        }
    }

    /// Last-resort hardcoded tariff: base + heuristic distance + per-kg
    /// weight + remote-area surcharge.
    fn fallback_template_quote(
        &self,
        request: &QuoteRequest,
        provider_chain: Vec<String>,
        remote_error: Option<AppError>,
        rule_error: Option<AppError>,
    ) -> QuoteResult {
        let base_fee = 12.0;
        let cross_region = request.origin.chars().take(2).collect::<String>()
            != request.destination.chars().take(2).collect::<String>();
        let distance_fee = if cross_region { 5.0 } else { 0.0 };
        let weight_fee = (request.weight_kg - 1.0).max(0.0) * 2.5;
        let merged = format!("{}{}", request.origin, request.destination);
        let remote_fee = if ["西藏", "新疆", "青海"].iter().any(|k| merged.contains(k)) {
            8.0
        } else {
            0.0
        };
        let total = base_fee + distance_fee + weight_fee + remote_fee;

        let mut surcharges = BTreeMap::new();
        surcharges.insert("distance".to_string(), distance_fee);
        surcharges.insert("weight".to_string(), weight_fee);
        if remote_fee > 0.0 {
            surcharges.insert("remote".to_string(), remote_fee);
        }

        let remote_msg = remote_error.map(|e| e.to_string()).unwrap_or_default();
        let rule_msg = rule_error.map(|e| e.to_string()).unwrap_or_default();

        let mut explain = serde_json::Map::new();
        explain.insert("mode".into(), "fallback_template".into());
        explain.insert("remote_error".into(), remote_msg.clone().into());
        explain.insert("rule_error".into(), rule_msg.clone().into());

        QuoteResult {
            provider: "fallback_template".into(),
            base_fee,
            surcharges,
            total_fee: (total * 100.0).round() / 100.0,
            currency: "CNY".into(),
            eta_minutes: 72 * 60,
            confidence: 0.5,
            explain,
            fallback_used: true,
            cache_hit: false,
            stale: false,
            snapshot: Some(QuoteSnapshot {
                cost_source: "fallback_template".into(),
                cost_version: "hardcoded".into(),
                pricing_rule_version: PRICING_RULE_VERSION.into(),
                latency_ms: 0,
                provider_chain,
                fallback_reason: format!(
                    "all_sources_failed: remote={remote_msg}, rule={rule_msg}"
                ),
            }),
        }
    }

    fn api_snapshot(&self) -> QuoteSnapshot {
        QuoteSnapshot {
            cost_source: "api".into(),
            cost_version: "live".into(),
            pricing_rule_version: PRICING_RULE_VERSION.into(),
            latency_ms: 0,
            provider_chain: vec!["api".into()],
            fallback_reason: String::new(),
        }
    }

    fn table_snapshot(
        &self,
        result: &QuoteResult,
        provider_chain: Vec<String>,
        fallback_reason: &str,
    ) -> QuoteSnapshot {
        // A cost-file match means the CSV table priced it; otherwise the
        // built-in tariff did.
        let from_table = result.explain.contains_key("cost_file");
        QuoteSnapshot {
            cost_source: "cost_table".into(),
            cost_version: if from_table { "local".into() } else { "builtin".into() },
            pricing_rule_version: PRICING_RULE_VERSION.into(),
            latency_ms: 0,
            provider_chain,
            fallback_reason: fallback_reason.to_string(),
        }
    }

    fn circuit_status(&self, name: &'static str) -> CircuitStatus {
        let circuits = self.circuits.lock();
        match circuits.get(name) {
            Some(c) => CircuitStatus {
                failures: c.failures,
                open: c.open_until.map(|t| t > Instant::now()).unwrap_or(false),
                half_open: c.half_open,
            },
            None => CircuitStatus {
                failures: 0,
                open: false,
                half_open: false,
            },
        }
    }

    fn is_open(&self, name: &'static str) -> bool {
        self.circuits
            .lock()
            .get(name)
            .and_then(|c| c.open_until)
            .map(|t| t > Instant::now())
            .unwrap_or(false)
    }

    fn is_half_open(&self, name: &'static str) -> bool {
        self.circuits
            .lock()
            .get(name)
            .map(|c| c.half_open)
            .unwrap_or(false)
    }

    /// Once the open window elapses, the next request becomes the probe.
    fn maybe_enter_half_open(&self, name: &'static str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name).or_default();
        if let Some(open_until) = circuit.open_until {
            if Instant::now() >= open_until {
                circuit.half_open = true;
                circuit.open_until = None;
                info!(source = name, "circuit breaker entering half-open");
            }
        }
    }

    fn record_failure(&self, name: &'static str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name).or_default();
        circuit.failures += 1;
        if circuit.half_open || circuit.failures >= self.circuit_fail_threshold {
            circuit.open_until = Some(Instant::now() + self.circuit_open);
            circuit.half_open = false;
            warn!(
                source = name,
                failures = circuit.failures,
                "circuit breaker opened"
            );
        }
    }

    fn record_success(&self, name: &'static str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name).or_default();
        if circuit.half_open {
            info!(source = name, "circuit breaker recovered from half-open");
        }
        circuit.failures = 0;
        circuit.open_until = None;
        circuit.half_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteProviderConfig;

    fn engine_with(config: QuoteConfig) -> AutoQuoteEngine {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.snapshot_db_path = dir
            .path()
            .join("snapshots.db")
            .to_string_lossy()
            .to_string();
        config.cost_table_dir = dir.path().join("tables").to_string_lossy().to_string();
        let cost_table = Arc::new(CostTableRepository::new(&config.cost_table_dir));
        // Leak the tempdir so the sqlite file outlives the test body.
        std::mem::forget(dir);
        AutoQuoteEngine::new(&config, cost_table).unwrap()
    }

    fn hybrid_failing_config() -> QuoteConfig {
        QuoteConfig {
            mode: QuoteMode::Hybrid,
            retry_times: 1,
            circuit_fail_threshold: 1,
            remote: RemoteProviderConfig {
                enabled: true,
                simulated_latency_ms: 0,
                failure_rate: 1.0,
            },
            ..QuoteConfig::default()
        }
    }

    #[tokio::test]
    async fn rule_only_mode_returns_explainable_result() {
        let engine = engine_with(QuoteConfig::default());
        let request = QuoteRequest::new("上海", "杭州", 2.0);
        let result = engine.get_quote(&request).await.unwrap();
        assert_eq!(result.provider, "rule_table");
        assert!(!result.fallback_used);
        let snapshot = result.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.provider_chain, vec!["cost_table"]);
        assert_eq!(result.explain_str("engine_version"), Some("v2.0"));
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let engine = engine_with(QuoteConfig::default());
        let request = QuoteRequest::new("上海", "杭州", 2.0);
        let first = engine.get_quote(&request).await.unwrap();
        assert!(!first.cache_hit);
        let second = engine.get_quote(&request).await.unwrap();
        assert!(second.cache_hit);
        assert!(!second.stale);
        assert_eq!(first.total_fee, second.total_fee);
    }

    #[tokio::test]
    async fn alias_spellings_share_cache_entries() {
        let engine = engine_with(QuoteConfig::default());
        let first = engine
            .get_quote(&QuoteRequest::new("北京", "上海", 1.0))
            .await
            .unwrap();
        assert!(!first.cache_hit);
        let second = engine
            .get_quote(&QuoteRequest::new("北京市", "上海市", 1.0))
            .await
            .unwrap();
        assert!(second.cache_hit);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_with_reason_and_chain() {
        let engine = engine_with(hybrid_failing_config());
        let result = engine
            .get_quote(&QuoteRequest::new("上海", "杭州", 1.0))
            .await
            .unwrap();
        assert!(result.fallback_used);
        let snapshot = result.snapshot.unwrap();
        assert_eq!(snapshot.provider_chain, vec!["hot_cache_miss", "cost_table"]);
        assert!(
            snapshot.fallback_reason.contains("temporary failure")
                || snapshot.fallback_reason.contains("timeout")
        );
    }

    #[tokio::test]
    async fn open_circuit_skips_remote_source() {
        let engine = engine_with(hybrid_failing_config());
        // First request trips the breaker (threshold 1).
        let r1 = engine
            .get_quote(&QuoteRequest::new("上海", "杭州", 1.0))
            .await
            .unwrap();
        assert!(r1.fallback_used);

        // Second distinct request must skip the remote source entirely.
        let r2 = engine
            .get_quote(&QuoteRequest::new("上海", "南京", 3.0))
            .await
            .unwrap();
        let snapshot = r2.snapshot.unwrap();
        assert_eq!(snapshot.provider_chain, vec!["hot_cache_miss", "cost_table"]);
        assert!(!snapshot.provider_chain.contains(&"api".to_string()));
        assert_eq!(snapshot.fallback_reason, "circuit_open");
    }

    #[tokio::test]
    async fn safety_margin_scales_total_fee() {
        let mut config = QuoteConfig::default();
        config.safety_margin = 0.10;
        let engine = engine_with(config);
        let request = QuoteRequest::new("上海", "杭州", 2.0);
        let result = engine.get_quote(&request).await.unwrap();
        // builtin tariff: 8 + 7 + 2 = 17, then x1.1
        assert!((result.total_fee - 18.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn disabled_engine_rejects_requests() {
        let mut config = QuoteConfig::default();
        config.enabled = false;
        let engine = engine_with(config);
        let err = engine
            .get_quote(&QuoteRequest::new("上海", "杭州", 1.0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
