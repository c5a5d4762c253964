//! Inbound intent classification and quote-field extraction.
//!
//! Order confirmation beats courier choice beats quote intent; anything
//! else falls to the keyword table. Quote parsing pulls route, weight
//! (with unit conversion), box volume, explicit volume-weight, pieces, and
//! urgency from free-form buyer text.

use lazy_static::lazy_static;
use regex::Regex;

const DEFAULT_QUOTE_KEYWORDS: &[&str] = &[
    "报价", "报个价", "多少钱", "运费", "邮费", "快递费", "寄到", "发到", "寄件", "时效",
    "多久到", "怎么收费",
];

const DEFAULT_ORDER_KEYWORDS: &[&str] = &[
    "下单", "已下单", "拍下", "已拍", "拍了", "已拍下", "付款", "已付款", "付了",
];

const URGENCY_KEYWORDS: &[&str] = &["加急", "急件", "当天", "立即", "马上", "最快", "尽快"];

const GREETINGS: &[&str] = &[
    "在吗", "在不在", "你好", "您好", "哈喽", "哈罗", "hello", "hi", "在么", "在嘛",
];

const KNOWN_COURIERS: &[&str] = &[
    "圆通", "中通", "韵达", "申通", "顺丰", "极兔", "德邦", "京东", "邮政", "菜鸟裹裹",
];

/// Trailing non-place words that greedy CJK captures drag in.
const LOCATION_TRIM_WORDS: &[&str] = &[
    "运费多少", "运费", "邮费", "快递费", "快递", "多少钱", "多少", "价格", "报价", "时效",
    "费用", "的",
];

lazy_static! {
    static ref ROUTE_RE: Regex = Regex::new(
        r"(?:从|由)?([一-龥]{2,12}?)(?:寄到|发到|送到|寄往|发往)([一-龥]{2,12})"
    )
    .expect("route regex");
    static ref DEST_ONLY_RE: Regex =
        Regex::new(r"(?:寄到|发到|送到|寄往|发往|到)([一-龥]{2,12})").expect("dest regex");
    static ref SEPARATOR_RE: Regex = Regex::new(
        r"([一-龥]{2,12})\s*[~～\-—－→]+\s*([一-龥]{2,12})"
    )
    .expect("separator regex");
    static ref LABELED_ORIGIN_RE: Regex =
        Regex::new(r"(?:寄件|始发|发自|发件)[:：\s]*([一-龥]{2,12})").expect("origin label");
    static ref LABELED_DEST_RE: Regex = Regex::new(
        r"(?:收件(?:地|地址)?|目的地|到达地)[:：\s]*([一-龥]{2,12})"
    )
    .expect("dest label");
    static ref WEIGHT_RE: Regex =
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(kg|公斤|斤|g|克)").expect("weight regex");
    static ref WEIGHT_LABEL_RE: Regex =
        Regex::new(r"重量[:：\s]*(\d+(?:\.\d+)?)").expect("weight label regex");
    static ref VOLUME_RE: Regex = Regex::new(
        r"(?i)(\d+(?:\.\d+)?)\s*[x×*]\s*(\d+(?:\.\d+)?)\s*[x×*]\s*(\d+(?:\.\d+)?)\s*(?:cm|厘米)?"
    )
    .expect("volume regex");
    static ref VOLUME_WEIGHT_RE: Regex =
        Regex::new(r"(?i)体积重\s*(\d+(?:\.\d+)?)\s*(?:kg|公斤)?").expect("volume weight regex");
    static ref PIECES_RE: Regex = Regex::new(r"(\d+)\s*(?:件|票|单)").expect("pieces regex");
}

#[derive(Debug, Clone, Default)]
pub struct ParsedQuote {
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub weight_kg: Option<f64>,
    pub volume_cc: Option<f64>,
    pub volume_weight_kg: Option<f64>,
    pub pieces: u32,
    pub urgent: bool,
    pub courier: Option<String>,
}

pub struct IntentParser {
    quote_keywords: Vec<String>,
    order_keywords: Vec<String>,
}

impl IntentParser {
    pub fn new(quote_keywords: &[String], order_keywords: &[String]) -> Self {
        let fallback = |configured: &[String], defaults: &[&str]| -> Vec<String> {
            let cleaned: Vec<String> = configured
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if cleaned.is_empty() {
                defaults.iter().map(|k| k.to_lowercase()).collect()
            } else {
                cleaned
            }
        };
        Self {
            quote_keywords: fallback(quote_keywords, DEFAULT_QUOTE_KEYWORDS),
            order_keywords: fallback(order_keywords, DEFAULT_ORDER_KEYWORDS),
        }
    }

    pub fn is_quote_request(&self, text: &str) -> bool {
        let lowered = text.trim().to_lowercase();
        if lowered.is_empty() {
            return false;
        }
        if self.quote_keywords.iter().any(|k| lowered.contains(k)) {
            return true;
        }
        // Route-shaped messages without keywords still count
        // (`杭州～北京～2kg`).
        let (origin, destination) = Self::extract_locations(text);
        origin.is_some() && destination.is_some() && Self::extract_weight_kg(text).is_some()
    }

    pub fn is_order_intent(&self, text: &str) -> bool {
        let lowered = text.trim().to_lowercase();
        !lowered.is_empty() && self.order_keywords.iter().any(|k| lowered.contains(k))
    }

    pub fn is_greeting(text: &str) -> bool {
        let compact: String = text
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace() && !"，。！？!?~,.".contains(*c))
            .collect();
        !compact.is_empty() && GREETINGS.contains(&compact.as_str())
    }

    /// Courier explicitly chosen from a previously quoted list.
    pub fn chosen_courier(&self, text: &str, quoted: &[String]) -> Option<String> {
        let text = text.trim();
        if text.is_empty() || quoted.is_empty() || self.is_quote_request(text) {
            return None;
        }
        quoted
            .iter()
            .find(|courier| !courier.is_empty() && text.contains(courier.as_str()))
            .cloned()
    }

    pub fn parse_quote(&self, text: &str) -> ParsedQuote {
        let (origin, destination) = Self::extract_locations(text);
        ParsedQuote {
            origin,
            destination,
            weight_kg: Self::extract_weight_kg(text),
            volume_cc: Self::extract_volume_cc(text),
            volume_weight_kg: VOLUME_WEIGHT_RE
                .captures(text)
                .and_then(|c| c[1].parse().ok()),
            pieces: PIECES_RE
                .captures(text)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(1)
                .max(1),
            urgent: {
                let lowered = text.to_lowercase();
                URGENCY_KEYWORDS.iter().any(|k| lowered.contains(k))
            },
            courier: KNOWN_COURIERS
                .iter()
                .find(|c| text.contains(*c))
                .map(|c| c.to_string()),
        }
    }

    fn trim_location(raw: &str) -> Option<String> {
        let mut place = raw.trim().to_string();
        loop {
            let mut trimmed = false;
            for word in LOCATION_TRIM_WORDS {
                if let Some(rest) = place.strip_suffix(word) {
                    place = rest.to_string();
                    trimmed = true;
                }
            }
            if !trimmed {
                break;
            }
        }
        (place.chars().count() >= 2).then_some(place)
    }

    pub fn extract_locations(text: &str) -> (Option<String>, Option<String>) {
        if let Some(caps) = ROUTE_RE.captures(text) {
            return (
                Self::trim_location(&caps[1]),
                Self::trim_location(&caps[2]),
            );
        }
        if let Some(caps) = SEPARATOR_RE.captures(text) {
            return (
                Self::trim_location(&caps[1]),
                Self::trim_location(&caps[2]),
            );
        }

        let labeled_origin = LABELED_ORIGIN_RE
            .captures(text)
            .and_then(|c| Self::trim_location(&c[1]));
        let labeled_dest = LABELED_DEST_RE
            .captures(text)
            .and_then(|c| Self::trim_location(&c[1]));
        if labeled_origin.is_some() || labeled_dest.is_some() {
            return (labeled_origin, labeled_dest);
        }

        let dest_only = DEST_ONLY_RE
            .captures(text)
            .and_then(|c| Self::trim_location(&c[1]));
        (None, dest_only)
    }

    pub fn extract_weight_kg(text: &str) -> Option<f64> {
        if let Some(caps) = WEIGHT_RE.captures(text) {
            let value: f64 = caps[1].parse().ok()?;
            let unit = caps[2].to_lowercase();
            let kg = match unit.as_str() {
                "kg" | "公斤" => value,
                "斤" => value * 0.5,
                "g" | "克" => value / 1000.0,
                _ => value,
            };
            return Some(kg.max(0.1));
        }
        WEIGHT_LABEL_RE
            .captures(text)
            .and_then(|c| c[1].parse::<f64>().ok())
            .map(|v| v.max(0.1))
    }

    fn extract_volume_cc(text: &str) -> Option<f64> {
        let caps = VOLUME_RE.captures(text)?;
        let l: f64 = caps[1].parse().ok()?;
        let w: f64 = caps[2].parse().ok()?;
        let h: f64 = caps[3].parse().ok()?;
        Some(l * w * h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> IntentParser {
        IntentParser::new(&[], &[])
    }

    #[test]
    fn extract_locations_non_greedy_origin() {
        let (origin, destination) =
            IntentParser::extract_locations("从安徽寄到北京市朝阳区 2kg 多少钱");
        assert_eq!(origin.as_deref(), Some("安徽"));
        assert_eq!(destination.as_deref(), Some("北京市朝阳区"));
    }

    #[test]
    fn extract_locations_with_by_prefix() {
        let (origin, destination) = IntentParser::extract_locations("由杭州发到深圳市 1kg 报价");
        assert_eq!(origin.as_deref(), Some("杭州"));
        assert_eq!(destination.as_deref(), Some("深圳市"));
    }

    #[test]
    fn extract_locations_compact_separator() {
        let (origin, destination) = IntentParser::extract_locations("杭州～北京～2kg");
        assert_eq!(origin.as_deref(), Some("杭州"));
        assert_eq!(destination.as_deref(), Some("北京"));
    }

    #[test]
    fn extract_locations_labeled_form() {
        let (origin, destination) = IntentParser::extract_locations("寄件杭州 收件北京 2kg");
        assert_eq!(origin.as_deref(), Some("杭州"));
        assert_eq!(destination.as_deref(), Some("北京"));
    }

    #[test]
    fn destination_only_trims_function_words() {
        let (origin, destination) = IntentParser::extract_locations("寄到北京运费多少");
        assert_eq!(origin, None);
        assert_eq!(destination.as_deref(), Some("北京"));
    }

    #[test]
    fn quote_intent_keywords_fall_back_when_config_empty() {
        let p = parser();
        assert!(p.is_quote_request("安徽到上海 1kg 圆通多少钱"));
        assert!(p.is_quote_request("从上海寄到杭州 2kg 多少钱"));
    }

    #[test]
    fn quote_detection_avoids_logistics_status_false_positive() {
        let p = parser();
        assert!(!p.is_quote_request("你好 到货了吗"));
        assert!(!p.is_quote_request("你好 到货了吗 2kg"));
    }

    #[test]
    fn route_shape_without_keyword_is_quote_intent() {
        let p = parser();
        assert!(p.is_quote_request("杭州～北京～2kg"));
    }

    #[test]
    fn weight_units_convert_to_kg() {
        assert_eq!(IntentParser::extract_weight_kg("2kg"), Some(2.0));
        assert_eq!(IntentParser::extract_weight_kg("3公斤"), Some(3.0));
        assert_eq!(IntentParser::extract_weight_kg("4斤"), Some(2.0));
        assert_eq!(IntentParser::extract_weight_kg("500g"), Some(0.5));
        assert_eq!(IntentParser::extract_weight_kg("重量：1.5"), Some(1.5));
        assert_eq!(IntentParser::extract_weight_kg("没有重量"), None);
    }

    #[test]
    fn volume_and_volume_weight_extract() {
        let parsed = parser().parse_quote("杭州～北京～2kg 30x20x10cm 体积重1.6kg");
        assert_eq!(parsed.volume_cc, Some(6000.0));
        assert_eq!(parsed.volume_weight_kg, Some(1.6));
        assert_eq!(parsed.weight_kg, Some(2.0));
    }

    #[test]
    fn urgency_and_pieces_and_courier() {
        let parsed = parser().parse_quote("从上海寄到杭州 2kg 3件 加急 顺丰");
        assert!(parsed.urgent);
        assert_eq!(parsed.pieces, 3);
        assert_eq!(parsed.courier.as_deref(), Some("顺丰"));
    }

    #[test]
    fn greeting_detection() {
        assert!(IntentParser::is_greeting("在吗"));
        assert!(IntentParser::is_greeting("你好！"));
        assert!(IntentParser::is_greeting(" Hello "));
        assert!(!IntentParser::is_greeting("你好 这个有货吗"));
    }

    #[test]
    fn order_intent_keywords() {
        let p = parser();
        assert!(p.is_order_intent("我已付款，麻烦安排"));
        assert!(p.is_order_intent("刚拍下了"));
        assert!(!p.is_order_intent("多少钱"));
    }

    #[test]
    fn courier_choice_matches_previously_quoted() {
        let p = parser();
        let quoted = vec!["圆通".to_string(), "中通".to_string()];
        assert_eq!(p.chosen_courier("选圆通", &quoted).as_deref(), Some("圆通"));
        assert_eq!(p.chosen_courier("就中通吧", &quoted).as_deref(), Some("中通"));
        assert_eq!(p.chosen_courier("选顺丰", &quoted), None);
        // A fresh quote mentioning a courier is not a choice.
        assert_eq!(p.chosen_courier("圆通多少钱", &quoted), None);
    }
}
