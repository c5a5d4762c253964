//! Primary quote cache: TTL + stale-while-revalidate window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::quote::models::QuoteResult;

struct CacheEntry {
    value: QuoteResult,
    expires_at: Instant,
    stale_until: Instant,
}

/// Lookup outcome: fresh hits are served as-is, stale hits are served
/// synchronously while the caller refreshes in the background.
pub enum CacheLookup {
    Miss,
    Fresh(QuoteResult),
    Stale(QuoteResult),
}

pub struct QuoteCache {
    ttl: Duration,
    max_stale: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl QuoteCache {
    pub fn new(ttl_seconds: u64, max_stale_seconds: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds.max(1)),
            max_stale: Duration::from_secs(max_stale_seconds),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> CacheLookup {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return CacheLookup::Miss;
        };

        if entry.expires_at >= now {
            let mut result = entry.value.clone();
            result.cache_hit = true;
            result.stale = false;
            return CacheLookup::Fresh(result);
        }

        if entry.stale_until >= now {
            let mut result = entry.value.clone();
            result.cache_hit = true;
            result.stale = true;
            return CacheLookup::Stale(result);
        }

        entries.remove(key);
        CacheLookup::Miss
    }

    pub fn set(&self, key: &str, result: QuoteResult) {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value: result,
                expires_at: now + self.ttl,
                stale_until: now + self.ttl + self.max_stale,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn result() -> QuoteResult {
        QuoteResult {
            provider: "rule_table".into(),
            base_fee: 8.0,
            surcharges: BTreeMap::new(),
            total_fee: 8.0,
            currency: "CNY".into(),
            eta_minutes: 2880,
            confidence: 0.88,
            explain: serde_json::Map::new(),
            fallback_used: false,
            cache_hit: false,
            stale: false,
            snapshot: None,
        }
    }

    #[test]
    fn fresh_hit_within_ttl() {
        let cache = QuoteCache::new(60, 300);
        cache.set("k", result());
        match cache.get("k") {
            CacheLookup::Fresh(r) => {
                assert!(r.cache_hit);
                assert!(!r.stale);
            }
            _ => panic!("expected fresh hit"),
        }
    }

    #[test]
    fn miss_when_absent() {
        let cache = QuoteCache::new(60, 300);
        assert!(matches!(cache.get("absent"), CacheLookup::Miss));
    }

    #[test]
    fn stale_hit_between_ttl_and_stale_window() {
        let cache = QuoteCache::new(1, 300);
        cache.set("k", result());
        std::thread::sleep(std::time::Duration::from_millis(1100));
        match cache.get("k") {
            CacheLookup::Stale(r) => {
                assert!(r.cache_hit);
                assert!(r.stale);
            }
            _ => panic!("expected stale hit"),
        }
    }

    #[test]
    fn evicted_after_stale_window() {
        let cache = QuoteCache::new(1, 0);
        cache.set("k", result());
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(cache.get("k"), CacheLookup::Miss));
    }
}
