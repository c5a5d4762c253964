//! Outbound cooldown policy: per-session minimum interval plus hourly and
//! daily send caps, computed from the send log in the session context.

use crate::config::OutboundConfig;
use crate::workflow::store::SessionContext;

const DEFAULT_BLOCK_KEYWORDS: &[&str] = &["微信", "vx", "qq", "qq群", "站外", "私下交易", "加我"];

pub struct OutboundPolicy {
    enabled: bool,
    min_interval_seconds: i64,
    max_per_session_hour: usize,
    max_per_session_day: usize,
    block_keywords: Vec<String>,
}

impl OutboundPolicy {
    pub fn new(config: &OutboundConfig) -> Self {
        let configured: Vec<String> = config
            .block_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            enabled: config.enabled,
            min_interval_seconds: config.min_interval_seconds as i64,
            max_per_session_hour: config.max_per_session_hour.max(1),
            max_per_session_day: config.max_per_session_day.max(1),
            block_keywords: if configured.is_empty() {
                DEFAULT_BLOCK_KEYWORDS.iter().map(|k| k.to_string()).collect()
            } else {
                configured
            },
        }
    }

    /// Returns `(allowed, reason)`.
    pub fn evaluate(
        &self,
        session_id: &str,
        reply_text: &str,
        context: &SessionContext,
        now: i64,
    ) -> (bool, String) {
        if !self.enabled {
            return (true, "disabled".into());
        }
        if session_id.trim().is_empty() {
            return (false, "missing_session_id".into());
        }
        let text = reply_text.trim();
        if text.is_empty() {
            return (false, "empty_reply".into());
        }

        let lowered = text.to_lowercase();
        if self.block_keywords.iter().any(|k| lowered.contains(k)) {
            return (false, "blocked_keyword".into());
        }

        if let Some(last_sent) = context.last_outbound_at {
            if last_sent > 0 && now - last_sent < self.min_interval_seconds {
                return (false, "min_interval_not_met".into());
            }
        }

        let day_cutoff = now - 86_400;
        let hour_cutoff = now - 3_600;
        let recent_day = context
            .outbound_timestamps
            .iter()
            .filter(|&&ts| ts >= day_cutoff)
            .count();
        let recent_hour = context
            .outbound_timestamps
            .iter()
            .filter(|&&ts| ts >= hour_cutoff)
            .count();

        if recent_hour >= self.max_per_session_hour {
            return (false, "max_per_session_hour_reached".into());
        }
        if recent_day >= self.max_per_session_day {
            return (false, "max_per_session_day_reached".into());
        }

        (true, "allowed".into())
    }

    /// Append a send to the session log, pruning anything older than a day.
    pub fn note_sent(context: &mut SessionContext, now: i64) {
        let cutoff = now - 86_400;
        context.outbound_timestamps.retain(|&ts| ts >= cutoff);
        context.outbound_timestamps.push(now);
        if context.outbound_timestamps.len() > 200 {
            let excess = context.outbound_timestamps.len() - 200;
            context.outbound_timestamps.drain(..excess);
        }
        context.last_outbound_at = Some(now);
        context.last_block_reason = None;
    }

    pub fn note_blocked(context: &mut SessionContext, reason: &str) {
        context.blocked_count += 1;
        context.last_block_reason = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> OutboundPolicy {
        OutboundPolicy::new(&OutboundConfig {
            min_interval_seconds: 10,
            max_per_session_hour: 2,
            max_per_session_day: 3,
            ..OutboundConfig::default()
        })
    }

    #[test]
    fn allows_first_send() {
        let (allowed, reason) = policy().evaluate("s1", "在的", &SessionContext::default(), 10_000);
        assert!(allowed);
        assert_eq!(reason, "allowed");
    }

    #[test]
    fn blocks_keyword_replies() {
        let (allowed, reason) = policy().evaluate(
            "s1",
            "加我微信聊",
            &SessionContext::default(),
            10_000,
        );
        assert!(!allowed);
        assert_eq!(reason, "blocked_keyword");
    }

    #[test]
    fn enforces_min_interval() {
        let mut ctx = SessionContext::default();
        OutboundPolicy::note_sent(&mut ctx, 10_000);
        let (allowed, reason) = policy().evaluate("s1", "好的", &ctx, 10_005);
        assert!(!allowed);
        assert_eq!(reason, "min_interval_not_met");

        let (allowed, _) = policy().evaluate("s1", "好的", &ctx, 10_020);
        assert!(allowed);
    }

    #[test]
    fn enforces_hourly_cap() {
        let mut ctx = SessionContext::default();
        let now = 100_000;
        OutboundPolicy::note_sent(&mut ctx, now - 300);
        OutboundPolicy::note_sent(&mut ctx, now - 200);
        let (allowed, reason) = policy().evaluate("s1", "好的", &ctx, now);
        assert!(!allowed);
        assert_eq!(reason, "max_per_session_hour_reached");
    }

    #[test]
    fn enforces_daily_cap_after_hour_rolls() {
        let mut ctx = SessionContext::default();
        let now = 200_000;
        // Three sends spread beyond the hour window but within the day.
        OutboundPolicy::note_sent(&mut ctx, now - 20_000);
        OutboundPolicy::note_sent(&mut ctx, now - 15_000);
        OutboundPolicy::note_sent(&mut ctx, now - 10_000);
        let (allowed, reason) = policy().evaluate("s1", "好的", &ctx, now);
        assert!(!allowed);
        assert_eq!(reason, "max_per_session_day_reached");
    }

    #[test]
    fn blocked_sends_are_counted() {
        let mut ctx = SessionContext::default();
        OutboundPolicy::note_blocked(&mut ctx, "blocked_keyword");
        assert_eq!(ctx.blocked_count, 1);
        assert_eq!(ctx.last_block_reason.as_deref(), Some("blocked_keyword"));
    }
}
