//! Layered compliance policy model.
//!
//! Policies resolve global -> account -> session. List fields in a higher
//! scope replace the lower scope's; rate-limit scalars merge field by field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub version: String,
    pub reload: ReloadPolicy,
    pub global: PolicyLayer,
    pub accounts: BTreeMap<String, PolicyLayer>,
    pub sessions: BTreeMap<String, PolicyLayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadPolicy {
    pub auto_reload: bool,
    pub check_interval_seconds: u64,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            auto_reload: true,
            check_interval_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyLayer {
    pub whitelist: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
    pub stop_words: Option<Vec<String>>,
    pub rate_limit: Option<RateLimitLayer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitLayer {
    pub account: Option<RateRuleLayer>,
    pub session: Option<RateRuleLayer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateRuleLayer {
    pub window_seconds: Option<i64>,
    pub max_messages: Option<i64>,
}

/// Fully-resolved policy for one evaluation.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub stop_words: Vec<String>,
    pub account_rate: RateRule,
    pub session_rate: RateRule,
    pub scope: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RateRule {
    pub window_seconds: i64,
    pub max_messages: i64,
}

impl PolicyFile {
    /// Built-in defaults applied underneath whatever the YAML file carries.
    pub fn builtin_defaults() -> Self {
        Self {
            version: "v1".into(),
            reload: ReloadPolicy::default(),
            global: PolicyLayer {
                whitelist: Some(Vec::new()),
                blacklist: Some(Vec::new()),
                stop_words: Some(
                    ["微信", "vx", "v信", "站外", "转账"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
                rate_limit: Some(RateLimitLayer {
                    account: Some(RateRuleLayer {
                        window_seconds: Some(60),
                        max_messages: Some(20),
                    }),
                    session: Some(RateRuleLayer {
                        window_seconds: Some(60),
                        max_messages: Some(8),
                    }),
                }),
            },
            accounts: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }

    /// Overlay `loaded` on top of the defaults: set fields win.
    pub fn merged_over_defaults(loaded: PolicyFile) -> Self {
        let mut base = Self::builtin_defaults();
        if !loaded.version.is_empty() {
            base.version = loaded.version;
        }
        base.reload = loaded.reload;
        merge_layer(&mut base.global, &loaded.global);
        base.accounts = loaded.accounts;
        base.sessions = loaded.sessions;
        base
    }

    pub fn resolve(&self, account_id: Option<&str>, session_id: Option<&str>) -> EffectivePolicy {
        let mut layer = self.global.clone();
        let mut scope = "global".to_string();

        if let Some(account_id) = account_id {
            if let Some(account_layer) = self.accounts.get(account_id) {
                merge_layer(&mut layer, account_layer);
                scope = format!("account:{account_id}");
            }
        }
        if let Some(session_id) = session_id {
            if let Some(session_layer) = self.sessions.get(session_id) {
                merge_layer(&mut layer, session_layer);
                scope = format!("session:{session_id}");
            }
        }

        let lower = |list: &Option<Vec<String>>| -> Vec<String> {
            list.as_deref()
                .unwrap_or(&[])
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let rate = |rule: Option<&RateRuleLayer>, default: RateRule| RateRule {
            window_seconds: rule
                .and_then(|r| r.window_seconds)
                .unwrap_or(default.window_seconds),
            max_messages: rule
                .and_then(|r| r.max_messages)
                .unwrap_or(default.max_messages),
        };
        let limits = layer.rate_limit.as_ref();

        EffectivePolicy {
            whitelist: lower(&layer.whitelist),
            blacklist: lower(&layer.blacklist),
            stop_words: lower(&layer.stop_words),
            account_rate: rate(
                limits.and_then(|l| l.account.as_ref()),
                RateRule {
                    window_seconds: 60,
                    max_messages: 20,
                },
            ),
            session_rate: rate(
                limits.and_then(|l| l.session.as_ref()),
                RateRule {
                    window_seconds: 60,
                    max_messages: 8,
                },
            ),
            scope,
        }
    }
}

fn merge_layer(base: &mut PolicyLayer, overlay: &PolicyLayer) {
    if overlay.whitelist.is_some() {
        base.whitelist = overlay.whitelist.clone();
    }
    if overlay.blacklist.is_some() {
        base.blacklist = overlay.blacklist.clone();
    }
    if overlay.stop_words.is_some() {
        base.stop_words = overlay.stop_words.clone();
    }
    if let Some(overlay_rate) = &overlay.rate_limit {
        let base_rate = base.rate_limit.get_or_insert_with(RateLimitLayer::default);
        if let Some(account) = &overlay_rate.account {
            let slot = base_rate.account.get_or_insert_with(RateRuleLayer::default);
            if account.window_seconds.is_some() {
                slot.window_seconds = account.window_seconds;
            }
            if account.max_messages.is_some() {
                slot.max_messages = account.max_messages;
            }
        }
        if let Some(session) = &overlay_rate.session {
            let slot = base_rate.session.get_or_insert_with(RateRuleLayer::default);
            if session.window_seconds.is_some() {
                slot.window_seconds = session.window_seconds;
            }
            if session.max_messages.is_some() {
                slot.max_messages = session.max_messages;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_global_stop_words() {
        let policy = PolicyFile::builtin_defaults();
        let effective = policy.resolve(None, None);
        assert!(effective.stop_words.contains(&"微信".to_string()));
        assert_eq!(effective.scope, "global");
        assert_eq!(effective.session_rate.max_messages, 8);
    }

    #[test]
    fn account_layer_overrides_lists_and_scope() {
        let mut policy = PolicyFile::builtin_defaults();
        policy.accounts.insert(
            "acct1".into(),
            PolicyLayer {
                stop_words: Some(vec!["电话".into()]),
                ..PolicyLayer::default()
            },
        );
        let effective = policy.resolve(Some("acct1"), None);
        assert_eq!(effective.scope, "account:acct1");
        assert_eq!(effective.stop_words, vec!["电话".to_string()]);
        // Unset fields inherit from global.
        assert_eq!(effective.account_rate.max_messages, 20);
    }

    #[test]
    fn session_layer_is_most_specific() {
        let mut policy = PolicyFile::builtin_defaults();
        policy.accounts.insert("acct1".into(), PolicyLayer::default());
        policy.sessions.insert(
            "s1".into(),
            PolicyLayer {
                rate_limit: Some(RateLimitLayer {
                    session: Some(RateRuleLayer {
                        window_seconds: None,
                        max_messages: Some(2),
                    }),
                    account: None,
                }),
                ..PolicyLayer::default()
            },
        );
        let effective = policy.resolve(Some("acct1"), Some("s1"));
        assert_eq!(effective.scope, "session:s1");
        assert_eq!(effective.session_rate.max_messages, 2);
        // Scalar merge keeps the inherited window.
        assert_eq!(effective.session_rate.window_seconds, 60);
    }

    #[test]
    fn yaml_layer_overlays_defaults() {
        let raw = r#"
version: v7
global:
  stop_words: ["站外"]
accounts:
  shop_a:
    blacklist: ["砍价"]
"#;
        let loaded: PolicyFile = serde_yaml::from_str(raw).unwrap();
        let policy = PolicyFile::merged_over_defaults(loaded);
        assert_eq!(policy.version, "v7");
        let effective = policy.resolve(Some("shop_a"), None);
        assert_eq!(effective.stop_words, vec!["站外".to_string()]);
        assert_eq!(effective.blacklist, vec!["砍价".to_string()]);
    }
}
