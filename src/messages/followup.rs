//! Read-no-reply follow-up policy. Disabled unless configured on; when a
//! session got a first reply and went quiet, at most `max_per_session`
//! gentle nudges go out, rotating templates, and any stop keyword from the
//! buyer opts the session out.

use crate::config::FollowupConfig;
use crate::workflow::store::SessionContext;

const DEFAULT_TEMPLATES: &[&str] = &[
    "看到你已读啦，我先把这个方案给你留着。需要我按你的重量和地区再精确算一次吗？",
    "如果你还在比较寄件方案，我可以按你的预算再给一个更省的选项，需要的话直接回我“继续报价”就行。",
];

const DEFAULT_STOP_KEYWORDS: &[&str] = &["不用", "不需要", "先不", "别发了", "勿扰", "拉黑", "举报"];

pub struct FollowupPolicy {
    enabled: bool,
    min_elapsed_seconds: i64,
    min_interval_seconds: i64,
    max_per_session: u32,
    templates: Vec<String>,
    stop_keywords: Vec<String>,
}

impl FollowupPolicy {
    pub fn new(config: &FollowupConfig) -> Self {
        let templates: Vec<String> = config
            .templates
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let stop_keywords: Vec<String> = config
            .stop_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            enabled: config.enabled,
            min_elapsed_seconds: config.min_elapsed_seconds as i64,
            min_interval_seconds: config.min_interval_seconds as i64,
            max_per_session: config.max_per_session as u32,
            templates: if templates.is_empty() {
                DEFAULT_TEMPLATES.iter().map(|t| t.to_string()).collect()
            } else {
                templates
            },
            stop_keywords: if stop_keywords.is_empty() {
                DEFAULT_STOP_KEYWORDS.iter().map(|k| k.to_string()).collect()
            } else {
                stop_keywords
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns `(eligible, reason)`.
    pub fn evaluate(
        &self,
        session_id: &str,
        last_inbound: &str,
        context: &SessionContext,
        now: i64,
    ) -> (bool, String) {
        if !self.enabled {
            return (false, "disabled".into());
        }
        if session_id.trim().is_empty() {
            return (false, "missing_session_id".into());
        }
        if context.opted_out {
            return (false, "opted_out".into());
        }

        let Some(first_reply_at) = context.first_reply_at.filter(|&ts| ts > 0) else {
            return (false, "no_first_reply".into());
        };
        if now - first_reply_at < self.min_elapsed_seconds {
            return (false, "too_soon_after_first_reply".into());
        }
        if context.followup_sent_count >= self.max_per_session {
            return (false, "max_followups_reached".into());
        }
        if let Some(last_followup_at) = context.last_followup_at.filter(|&ts| ts > 0) {
            if now - last_followup_at < self.min_interval_seconds {
                return (false, "min_interval_not_met".into());
            }
        }

        if self.hit_stop_keywords(last_inbound, context) {
            return (false, "stop_keyword_hit".into());
        }

        (true, "eligible".into())
    }

    pub fn build_message(&self, context: &SessionContext, peer_name: &str, item_title: &str) -> String {
        let index = context.followup_sent_count as usize % self.templates.len();
        self.templates[index]
            .replace("{peer_name}", if peer_name.is_empty() { "你" } else { peer_name })
            .replace(
                "{item_title}",
                if item_title.is_empty() { "这个商品" } else { item_title },
            )
    }

    pub fn note_followup_sent(context: &mut SessionContext, now: i64) {
        context.followup_sent_count += 1;
        context.last_followup_at = Some(now);
    }

    fn hit_stop_keywords(&self, last_inbound: &str, context: &SessionContext) -> bool {
        let merged = format!(
            "{} {}",
            last_inbound.to_lowercase(),
            context
                .last_inbound_message
                .as_deref()
                .unwrap_or("")
                .to_lowercase()
        );
        self.stop_keywords.iter().any(|k| merged.contains(k))
    }
}
