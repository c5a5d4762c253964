//! Quote domain models.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUOTE_REPLY_TEMPLATE: &str =
    "您好，{origin} 到 {destination}，预估报价 ¥{price}（{price_breakdown}）。预计时效约 {eta_days}。";

/// Shipping quote request. Origin/destination are normalized before
/// cache-keying; weights and volumes bucket into coarse steps so near-equal
/// requests share cache entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub origin: String,
    pub destination: String,
    pub weight_kg: f64,
    #[serde(default)]
    pub volume_cc: f64,
    #[serde(default)]
    pub volume_weight_kg: f64,
    #[serde(default = "default_service_level")]
    pub service_level: String,
    #[serde(default = "default_courier")]
    pub courier: String,
    #[serde(default = "default_item_type")]
    pub item_type: String,
    #[serde(default = "default_time_window")]
    pub time_window: String,
}

fn default_service_level() -> String {
    "standard".into()
}

fn default_courier() -> String {
    "auto".into()
}

fn default_item_type() -> String {
    "general".into()
}

fn default_time_window() -> String {
    "normal".into()
}

impl QuoteRequest {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>, weight_kg: f64) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            weight_kg,
            volume_cc: 0.0,
            volume_weight_kg: 0.0,
            service_level: default_service_level(),
            courier: default_courier(),
            item_type: default_item_type(),
            time_window: default_time_window(),
        }
    }

    /// Buckets: weight 0.5 kg, volume 500 cc, volume-weight 0.5 kg.
    pub fn cache_key(&self) -> String {
        let weight_bucket = (self.weight_kg * 2.0).round() / 2.0;
        let volume_bucket = (self.volume_cc / 500.0).round() * 500.0;
        let volume_weight_bucket = (self.volume_weight_kg * 2.0).round() / 2.0;
        format!(
            "{}|{}|{}|{:.1}|{:.0}|{:.1}|{}",
            self.origin,
            self.destination,
            self.courier,
            weight_bucket,
            volume_bucket,
            volume_weight_bucket,
            self.service_level
        )
        .to_lowercase()
    }
}

/// Traceability record attached to every quote: where the price came from
/// and which sources were consulted on the way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub cost_source: String,
    pub cost_version: String,
    pub pricing_rule_version: String,
    pub latency_ms: u64,
    pub provider_chain: Vec<String>,
    pub fallback_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResult {
    pub provider: String,
    pub base_fee: f64,
    #[serde(default)]
    pub surcharges: BTreeMap<String, f64>,
    pub total_fee: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub eta_minutes: u32,
    pub confidence: f64,
    #[serde(default)]
    pub explain: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub snapshot: Option<QuoteSnapshot>,
}

fn default_currency() -> String {
    "CNY".into()
}

lazy_static! {
    static ref VALIDITY_CLAUSE_RE: Regex =
        Regex::new(r"[，,]?\s*报价有效期\s*\d+\s*分钟[。.]?").expect("validity clause regex");
    static ref MULTI_SPACE_RE: Regex = Regex::new(r"\s{2,}").expect("multi space regex");
}

impl QuoteResult {
    pub fn explain_str(&self, key: &str) -> Option<&str> {
        self.explain.get(key).and_then(|v| v.as_str())
    }

    pub fn explain_f64(&self, key: &str) -> Option<f64> {
        self.explain.get(key).and_then(|v| v.as_f64())
    }

    /// `"2天"` / `"1.5天"`; ceil-ish from minutes with a 1-day floor.
    pub fn format_eta_days(eta_minutes: u32) -> String {
        if eta_minutes == 0 {
            return "1天".into();
        }
        let days = (eta_minutes as f64 / 1440.0).max(1.0);
        let rounded = (days * 10.0).round() / 10.0;
        if (rounded - rounded.round()).abs() < 1e-9 {
            format!("{}天", rounded.round() as u32)
        } else {
            format!("{rounded:.1}天")
        }
    }

    /// Drop any `报价有效期 N 分钟` clause; we cannot guarantee a validity
    /// window once compliance and cooldowns gate the send.
    pub fn strip_validity_clause(text: &str) -> String {
        let cleaned = VALIDITY_CLAUSE_RE.replace_all(text, "");
        let cleaned = MULTI_SPACE_RE.replace_all(cleaned.trim(), " ");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return String::new();
        }
        match cleaned.chars().last() {
            Some('。') | Some('！') | Some('？') | Some('!') | Some('?') => cleaned.to_string(),
            _ => format!("{cleaned}。"),
        }
    }

    fn price_breakdown(&self) -> String {
        let mut breakdown = format!("基础运费 ¥{:.2}", self.base_fee);
        for (name, value) in &self.surcharges {
            breakdown.push_str(&format!(" + {name} ¥{value:.2}"));
        }
        breakdown
    }

    /// Render a reply from the template, substituting the supported
    /// placeholders. Unknown placeholders left in the template trigger the
    /// built-in fallback so a bad template never breaks the reply chain.
    pub fn compose_reply(&self, template: Option<&str>, validity_minutes: u32) -> String {
        let origin = self
            .explain_str("matched_origin")
            .or_else(|| self.explain_str("normalized_origin"))
            .unwrap_or("寄件地")
            .to_string();
        let destination = self
            .explain_str("matched_destination")
            .or_else(|| self.explain_str("normalized_destination"))
            .unwrap_or("收件地")
            .to_string();
        let courier = self
            .explain_str("matched_courier")
            .or_else(|| self.explain_str("courier"))
            .unwrap_or("当前渠道")
            .to_string();
        let volume_formula = match self.explain_f64("volume_divisor") {
            Some(d) if d > 0.0 => format!("体积(cm³)/{}", d as u64),
            _ => "体积重规则".to_string(),
        };
        let billing_weight = self
            .explain_f64("billing_weight_kg")
            .map(|w| format!("{w:.1}"))
            .unwrap_or_default();
        let actual_weight = self
            .explain_f64("actual_weight_kg")
            .map(|w| format!("{w:.1}"))
            .unwrap_or_default();
        let additional_units = self
            .explain_f64("billing_weight_kg")
            .map(|w| (w - 1.0).max(0.0))
            .unwrap_or(0.0);
        let remaining_price = self.surcharges.get("续重").copied().unwrap_or(0.0);
        let eta_days = Self::format_eta_days(self.eta_minutes);

        let substitutions: Vec<(&str, String)> = vec![
            ("{origin}", origin.clone()),
            ("{destination}", destination.clone()),
            ("{courier}", courier.clone()),
            ("{courier_name}", courier),
            ("{price}", format!("{:.2}", self.total_fee)),
            ("{total_price}", format!("{:.2}", self.total_fee)),
            ("{first_price}", format!("{:.2}", self.base_fee)),
            ("{remaining_price}", format!("{remaining_price:.2}")),
            ("{currency}", self.currency.clone()),
            ("{price_breakdown}", self.price_breakdown()),
            ("{eta_days}", eta_days.clone()),
            ("{weight}", actual_weight.clone()),
            ("{actual_weight}", actual_weight),
            ("{billing_weight}", billing_weight),
            ("{additional_units}", format!("{additional_units:.1}")),
            ("{volume_formula}", volume_formula),
            ("{validity_minutes}", validity_minutes.to_string()),
        ];

        let tpl = template.unwrap_or(DEFAULT_QUOTE_REPLY_TEMPLATE);
        let mut rendered = tpl.to_string();
        for (key, value) in &substitutions {
            rendered = rendered.replace(key, value);
        }

        if rendered.contains('{') && rendered.contains('}') {
            let fallback = format!(
                "您好，{origin} 到 {destination}，预估报价 ¥{:.2}（{}）。预计时效约 {eta_days}。",
                self.total_fee,
                self.price_breakdown(),
            );
            return Self::strip_validity_clause(&fallback);
        }

        Self::strip_validity_clause(&rendered)
    }
}
