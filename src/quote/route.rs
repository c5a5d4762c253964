//! Route normalization for cache keys and same-place comparisons.

use crate::quote::models::QuoteRequest;

/// Province-level aliases: short names fold onto the full administrative
/// name so `北京` and `北京市` key identically.
const ALIAS_MAP: &[(&str, &str)] = &[
    ("北京", "北京市"),
    ("北京市", "北京市"),
    ("上海", "上海市"),
    ("上海市", "上海市"),
    ("天津", "天津市"),
    ("天津市", "天津市"),
    ("重庆", "重庆市"),
    ("重庆市", "重庆市"),
    ("内蒙", "内蒙古自治区"),
    ("内蒙古", "内蒙古自治区"),
    ("新疆", "新疆维吾尔自治区"),
    ("广西", "广西壮族自治区"),
    ("宁夏", "宁夏回族自治区"),
    ("西藏", "西藏自治区"),
    ("香港", "香港特别行政区"),
    ("澳门", "澳门特别行政区"),
];

const ADMIN_SUFFIXES: &[&str] = &[
    "特别行政区",
    "自治区",
    "自治州",
    "地区",
    "省",
    "市",
    "区",
    "县",
];

fn alias_lookup(text: &str) -> Option<&'static str> {
    ALIAS_MAP
        .iter()
        .find(|(k, _)| *k == text)
        .map(|(_, v)| *v)
}

pub fn normalize_location(raw: &str) -> String {
    let text: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if text.is_empty() {
        return String::new();
    }
    if let Some(full) = alias_lookup(&text) {
        return full.to_string();
    }

    // Fold administrative suffixes so synonymous spellings share a key.
    let base = ADMIN_SUFFIXES
        .iter()
        .find_map(|s| text.strip_suffix(s))
        .unwrap_or(&text);
    match alias_lookup(base) {
        Some(full) => full.to_string(),
        None => text,
    }
}

pub fn normalize_request_route(request: &QuoteRequest) -> QuoteRequest {
    let mut normalized = request.clone();
    normalized.origin = normalize_location(&request.origin);
    normalized.destination = normalize_location(&request.destination);
    normalized.service_level = if request.service_level.trim().is_empty() {
        "standard".into()
    } else {
        request.service_level.trim().to_lowercase()
    };
    normalized.courier = if request.courier.trim().is_empty() {
        "auto".into()
    } else {
        request.courier.trim().to_lowercase()
    };
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_full_spellings_normalize_identically() {
        assert_eq!(normalize_location("北京"), normalize_location("北京市"));
        assert_eq!(normalize_location("上海"), normalize_location("上海市"));
        assert_eq!(normalize_location("内蒙古"), "内蒙古自治区");
    }

    #[test]
    fn unknown_locations_pass_through() {
        assert_eq!(normalize_location("杭州"), "杭州");
        assert_eq!(normalize_location(" 杭 州 "), "杭州");
        assert_eq!(normalize_location(""), "");
    }

    #[test]
    fn normalized_requests_share_cache_keys() {
        let a = QuoteRequest::new("北京", "上海", 2.0);
        let b = QuoteRequest::new("北京市", "上海市", 2.0);
        assert_eq!(
            normalize_request_route(&a).cache_key(),
            normalize_request_route(&b).cache_key()
        );
    }
}
