//! Quote provider adapters.
//!
//! `RuleTableQuoteProvider` prices from the CSV cost table and falls back to
//! a built-in service-level tariff when the table has no route. The remote
//! provider is a mock with configurable latency and failure injection so the
//! hybrid path (retries, circuit breaker) stays exercisable offline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;

use crate::config::{QuoteConfig, RemoteProviderConfig};
use crate::errors::AppError;
use crate::quote::cost_table::{CostRecord, CostTableRepository};
use crate::quote::models::{QuoteRequest, QuoteResult};

const REMOTE_AREA_KEYWORDS: &[&str] = &[
    "西藏", "新疆", "青海", "内蒙古", "甘肃", "宁夏", "海南", "偏远",
];

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn get_quote(&self, request: &QuoteRequest, timeout_ms: u64)
        -> Result<QuoteResult, AppError>;

    async fn health_check(&self) -> bool;
}

pub struct RuleTableQuoteProvider {
    cost_table: Arc<CostTableRepository>,
    volume_divisor: f64,
    preferred_couriers: Vec<String>,
}

impl RuleTableQuoteProvider {
    pub fn new(cost_table: Arc<CostTableRepository>, config: &QuoteConfig) -> Self {
        Self {
            cost_table,
            volume_divisor: if config.volume_divisor > 0.0 {
                config.volume_divisor
            } else {
                6000.0
            },
            preferred_couriers: config.preferred_couriers.clone(),
        }
    }

    /// max(actual, explicit volume-weight, volume/divisor).
    fn billing_weight(&self, request: &QuoteRequest, throw_ratio: Option<f64>) -> (f64, f64) {
        let divisor = throw_ratio.filter(|r| *r > 0.0).unwrap_or(self.volume_divisor);
        let from_volume = if request.volume_cc > 0.0 {
            request.volume_cc / divisor
        } else {
            0.0
        };
        let volume_weight = request.volume_weight_kg.max(from_volume);
        (request.weight_kg.max(volume_weight).max(0.1), divisor)
    }

    fn record_fee(&self, record: &CostRecord, billing_weight: f64) -> (f64, f64) {
        let extra_units = (billing_weight - 1.0).max(0.0).ceil();
        let extra_fee = extra_units * record.extra_cost;
        (record.first_cost + extra_fee, extra_fee)
    }

    fn quote_from_table(
        &self,
        request: &QuoteRequest,
        candidates: Vec<CostRecord>,
    ) -> QuoteResult {
        // Cheapest row per courier, cheapest courier first.
        let mut per_courier: Vec<&CostRecord> = Vec::new();
        for record in &candidates {
            if !per_courier.iter().any(|r| r.courier == record.courier) {
                per_courier.push(record);
            }
        }
        let best = per_courier[0];
        let (billing_weight, divisor) = self.billing_weight(request, best.throw_ratio);
        let (total, extra_fee) = self.record_fee(best, billing_weight);

        let option_cap = self.preferred_couriers.len().max(4);
        let options: Vec<serde_json::Value> = per_courier
            .iter()
            .take(option_cap)
            .map(|record| {
                let (bw, _) = self.billing_weight(request, record.throw_ratio);
                let (fee, _) = self.record_fee(record, bw);
                json!({
                    "courier": record.courier,
                    "total_fee": (fee * 100.0).round() / 100.0,
                    "first_cost": record.first_cost,
                    "extra_cost": record.extra_cost,
                })
            })
            .collect();

        let mut surcharges = BTreeMap::new();
        if extra_fee > 0.0 {
            surcharges.insert("续重".to_string(), extra_fee);
        }

        let eta_minutes = base_eta_minutes(&request.service_level)
            + remote_area_extra_minutes(&request.origin, &request.destination);

        let mut explain = serde_json::Map::new();
        explain.insert("matched_origin".into(), best.origin.clone().into());
        explain.insert("matched_destination".into(), best.destination.clone().into());
        explain.insert("matched_courier".into(), best.courier.clone().into());
        explain.insert("actual_weight_kg".into(), json!(request.weight_kg));
        explain.insert("billing_weight_kg".into(), json!(billing_weight));
        explain.insert("volume_weight_kg".into(), json!(request.volume_weight_kg));
        explain.insert("volume_divisor".into(), json!(divisor));
        explain.insert("cost_file".into(), best.source_file.clone().into());
        if options.len() > 1 {
            explain.insert("courier_options".into(), serde_json::Value::Array(options));
        }

        QuoteResult {
            provider: "rule_table".into(),
            base_fee: best.first_cost,
            surcharges,
            total_fee: (total * 100.0).round() / 100.0,
            currency: "CNY".into(),
            eta_minutes,
            confidence: 0.9,
            explain,
            fallback_used: false,
            cache_hit: false,
            stale: false,
            snapshot: None,
        }
    }

    /// Service-level tariff used when the cost table has no matching route.
    fn quote_builtin(&self, request: &QuoteRequest) -> QuoteResult {
        let service_level = request.service_level.to_lowercase();
        let base_fee = match service_level.as_str() {
            "express" => 12.0,
            "urgent" => 18.0,
            _ => 8.0,
        };
        let mut eta_minutes = base_eta_minutes(&service_level);

        let same_city = request.origin.trim() == request.destination.trim();
        let mut distance_fee = if same_city { 0.0 } else { 4.0 };
        if !same_city && first_two_chars(&request.origin) != first_two_chars(&request.destination)
        {
            distance_fee += 3.0;
        }

        let (billing_weight, divisor) = self.billing_weight(request, None);
        let weight_fee = (billing_weight - 1.0).max(0.0) * 2.0;

        let remote_extra = remote_area_extra_minutes(&request.origin, &request.destination);
        eta_minutes += remote_extra;

        let mut surcharges = BTreeMap::new();
        surcharges.insert("distance".to_string(), distance_fee);
        surcharges.insert("weight".to_string(), weight_fee);
        if remote_extra > 0 {
            surcharges.insert("remote".to_string(), 8.0);
        }

        let total: f64 = base_fee + surcharges.values().sum::<f64>();

        let mut explain = serde_json::Map::new();
        explain.insert("service_level".into(), service_level.into());
        explain.insert("same_city".into(), json!(same_city));
        explain.insert("actual_weight_kg".into(), json!(request.weight_kg));
        explain.insert("billing_weight_kg".into(), json!(billing_weight));
        explain.insert("volume_divisor".into(), json!(divisor));

        QuoteResult {
            provider: "rule_table".into(),
            base_fee,
            surcharges,
            total_fee: (total * 100.0).round() / 100.0,
            currency: "CNY".into(),
            eta_minutes,
            confidence: 0.88,
            explain,
            fallback_used: false,
            cache_hit: false,
            stale: false,
            snapshot: None,
        }
    }
}

#[async_trait]
impl QuoteProvider for RuleTableQuoteProvider {
    async fn get_quote(
        &self,
        request: &QuoteRequest,
        _timeout_ms: u64,
    ) -> Result<QuoteResult, AppError> {
        if request.destination.trim().is_empty() {
            return Err(AppError::quote("missing destination"));
        }
        let courier = if request.courier == "auto" {
            None
        } else {
            Some(request.courier.as_str())
        };
        let candidates =
            self.cost_table
                .find_candidates(&request.origin, &request.destination, courier, 24);
        if candidates.is_empty() {
            Ok(self.quote_builtin(request))
        } else {
            Ok(self.quote_from_table(request, candidates))
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub struct RemoteQuoteProvider {
    enabled: bool,
    simulated_latency_ms: u64,
    failure_rate: f64,
}

impl RemoteQuoteProvider {
    pub fn new(config: &RemoteProviderConfig) -> Self {
        Self {
            enabled: config.enabled,
            simulated_latency_ms: config.simulated_latency_ms,
            failure_rate: config.failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl QuoteProvider for RemoteQuoteProvider {
    async fn get_quote(
        &self,
        request: &QuoteRequest,
        timeout_ms: u64,
    ) -> Result<QuoteResult, AppError> {
        if !self.enabled {
            return Err(AppError::quote("Remote provider disabled"));
        }

        let budget_ms = timeout_ms.max(50);
        tokio::time::sleep(Duration::from_millis(self.simulated_latency_ms.min(budget_ms))).await;

        if self.simulated_latency_ms > budget_ms {
            return Err(AppError::quote("Remote provider timeout"));
        }
        if rand::thread_rng().gen::<f64>() < self.failure_rate {
            return Err(AppError::quote("Remote provider temporary failure"));
        }

        let base_fee = if request.service_level == "urgent" { 16.0 } else { 10.0 };
        let dynamic = request.weight_kg * 2.2
            + if request.origin == request.destination { 0.0 } else { 3.5 };
        let fuel = ((base_fee + dynamic) * 0.08 * 100.0).round() / 100.0;
        let total = ((base_fee + dynamic + fuel) * 100.0).round() / 100.0;
        let eta_minutes = if request.service_level == "express" { 16 * 60 } else { 30 * 60 };

        let mut surcharges = BTreeMap::new();
        surcharges.insert("dynamic".to_string(), (dynamic * 100.0).round() / 100.0);
        surcharges.insert("fuel".to_string(), fuel);

        let mut explain = serde_json::Map::new();
        explain.insert("source".into(), "remote_mock".into());
        explain.insert("weight_kg".into(), json!(request.weight_kg));

        Ok(QuoteResult {
            provider: "remote_mock".into(),
            base_fee,
            surcharges,
            total_fee: total,
            currency: "CNY".into(),
            eta_minutes,
            confidence: 0.93,
            explain,
            fallback_used: false,
            cache_hit: false,
            stale: false,
            snapshot: None,
        })
    }

    async fn health_check(&self) -> bool {
        self.enabled
    }
}

fn base_eta_minutes(service_level: &str) -> u32 {
    match service_level {
        "express" => 24 * 60,
        "urgent" => 12 * 60,
        _ => 48 * 60,
    }
}

fn remote_area_extra_minutes(origin: &str, destination: &str) -> u32 {
    let merged = format!("{origin}{destination}");
    if REMOTE_AREA_KEYWORDS.iter().any(|k| merged.contains(k)) {
        24 * 60
    } else {
        0
    }
}

fn first_two_chars(text: &str) -> String {
    text.chars().take(2).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuoteConfig;

    fn rule_provider() -> RuleTableQuoteProvider {
        let repo = Arc::new(CostTableRepository::new("/nonexistent"));
        RuleTableQuoteProvider::new(repo, &QuoteConfig::default())
    }

    #[tokio::test]
    async fn builtin_tariff_prices_cross_city_standard() {
        let provider = rule_provider();
        let request = QuoteRequest::new("上海市", "杭州", 2.0);
        let result = provider.get_quote(&request, 3000).await.unwrap();
        assert_eq!(result.provider, "rule_table");
        // base 8 + distance 4+3 + weight (2-1)*2 = 17
        assert!((result.total_fee - 17.0).abs() < 1e-6);
        assert_eq!(result.eta_minutes, 48 * 60);
    }

    #[tokio::test]
    async fn builtin_tariff_adds_remote_area_surcharge() {
        let provider = rule_provider();
        let request = QuoteRequest::new("杭州", "新疆维吾尔自治区", 1.0);
        let result = provider.get_quote(&request, 3000).await.unwrap();
        assert!(result.surcharges.contains_key("remote"));
        assert_eq!(result.eta_minutes, 72 * 60);
    }

    #[tokio::test]
    async fn volume_weight_drives_billing_weight() {
        let provider = rule_provider();
        let mut request = QuoteRequest::new("上海市", "杭州", 1.0);
        request.volume_cc = 18_000.0; // 3 kg at /6000
        let result = provider.get_quote(&request, 3000).await.unwrap();
        let billing = result.explain_f64("billing_weight_kg").unwrap();
        assert!((billing - 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn remote_disabled_errors() {
        let provider = RemoteQuoteProvider::new(&RemoteProviderConfig::default());
        let request = QuoteRequest::new("上海市", "杭州", 1.0);
        assert!(provider.get_quote(&request, 1000).await.is_err());
    }

    #[tokio::test]
    async fn remote_timeout_when_latency_exceeds_budget() {
        let provider = RemoteQuoteProvider::new(&RemoteProviderConfig {
            enabled: true,
            simulated_latency_ms: 200,
            failure_rate: 0.0,
        });
        let request = QuoteRequest::new("上海市", "杭州", 1.0);
        let err = provider.get_quote(&request, 50).await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn remote_failure_injection_always_fails_at_rate_one() {
        let provider = RemoteQuoteProvider::new(&RemoteProviderConfig {
            enabled: true,
            simulated_latency_ms: 0,
            failure_rate: 1.0,
        });
        let request = QuoteRequest::new("上海市", "杭州", 1.0);
        let err = provider.get_quote(&request, 1000).await.unwrap_err();
        assert!(err.to_string().contains("temporary failure"));
    }
}
