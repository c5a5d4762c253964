//! Message service: intent classification, reply composition, and the
//! outbound pipeline (compliance gate -> cooldown -> transport, with DOM
//! fallback in auto mode).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compliance::ComplianceCenter;
use crate::config::{AppConfig, MessagesConfig, QuoteConfig, TransportMode};
use crate::messages::followup::FollowupPolicy;
use crate::messages::intent::IntentParser;
use crate::messages::outbound::OutboundPolicy;
use crate::quote::models::{QuoteRequest, QuoteResult};
use crate::quote::AutoQuoteEngine;
use crate::transport::{ChatTransport, InboundSession};
use crate::workflow::store::{SessionContext, WorkflowStore};

pub const DEFAULT_FORMAT_HINT: &str = "询价格式：xx省 - xx省 - 重量（kg）\n长宽高（单位cm），示例：浙江省 - 北京市 - 2kg 30x20x10cm。按这个格式发我，马上给你算价格。";

const DEFAULT_ORDER_ACK: &str =
    "收到你的订单，我这边开始处理，结果会优先在闲鱼聊天内同步，请耐心等我一下。";

const SINGLE_COURIER_QUOTE_TEMPLATE: &str = "您好，{origin} 到 {destination}，{courier} 首单价格 ¥{price}（{price_breakdown}），计费重 {billing_weight}kg。预计时效约 {eta_days}。";

const BUILTIN_KEYWORD_REPLIES: &[(&str, &str)] = &[
    ("还在", "在的，商品还在，直接拍就可以。"),
    ("在吗", "在的，有需要可以直接下单。"),
    ("最低", "价格已经尽量实在了，诚心要的话可以小刀。"),
    ("便宜", "价格是参考同款成色定的，诚心要可以聊。"),
    ("包邮", "默认不包邮，具体看地区可以商量。"),
    ("瑕疵", "有正常使用痕迹，主要细节我都拍在图里了。"),
    ("发票", "如需发票或购买凭证，我可以帮你再确认一下。"),
    ("验货", "支持走闲鱼平台流程，验货后确认收货更安心。"),
    ("自提", "可以自提，时间地点可以私聊约。"),
    ("卡密", "虚拟商品自动发货，拍下后卡密会直接发到聊天里，请留意消息。"),
    ("代下单", "支持代下单服务，把需求发我，确认后我来安排。"),
];

/// Per-message result descriptor consumed by the worker and the CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessOutcome {
    pub session_id: String,
    pub peer_name: String,
    pub last_message: String,
    pub reply: String,
    pub sent: bool,
    pub dry_run: bool,
    pub is_quote: bool,
    pub quote_success: bool,
    pub quote_need_info: bool,
    pub quote_fallback: bool,
    pub quote_blocked_by_policy: bool,
    pub blocked_by_policy: bool,
    pub block_reason: Option<String>,
    pub is_order_intent: bool,
    pub courier_locked: bool,
    pub format_enforced: bool,
    pub format_enforced_reason: Option<String>,
    pub first_reply_sent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoReplyReport {
    pub action: &'static str,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub dry_run: bool,
    pub quote_total: usize,
    pub quote_success_rate: f64,
    pub details: Vec<ProcessOutcome>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FollowupReport {
    pub eligible: usize,
    pub success: usize,
    pub skipped: usize,
}

/// Seam the worker drives; lets tests orchestrate without a live transport.
#[async_trait]
pub trait SessionProcessor: Send + Sync {
    async fn unread_sessions(&self, limit: usize) -> Vec<InboundSession>;
    async fn process_session(
        &self,
        session: &InboundSession,
        dry_run: bool,
        actor: &str,
    ) -> Result<ProcessOutcome>;
    async fn followup_pass(&self, _limit: usize, _dry_run: bool) -> FollowupReport {
        FollowupReport::default()
    }
}

pub struct MessageService {
    config: MessagesConfig,
    quote_config: QuoteConfig,
    intent: IntentParser,
    keyword_replies: Vec<(String, String)>,
    outbound: OutboundPolicy,
    followup: FollowupPolicy,
    compliance: Arc<ComplianceCenter>,
    store: Arc<WorkflowStore>,
    quote_engine: Arc<AutoQuoteEngine>,
    ws: Option<Arc<dyn ChatTransport>>,
    dom: Option<Arc<dyn ChatTransport>>,
}

impl MessageService {
    pub fn new(
        config: &AppConfig,
        store: Arc<WorkflowStore>,
        compliance: Arc<ComplianceCenter>,
        quote_engine: Arc<AutoQuoteEngine>,
        ws: Option<Arc<dyn ChatTransport>>,
        dom: Option<Arc<dyn ChatTransport>>,
    ) -> Self {
        let messages = config.messages.clone();

        // Built-in table first, config overrides on top, longest key wins.
        let mut keyword_replies: Vec<(String, String)> = BUILTIN_KEYWORD_REPLIES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, value) in &messages.keyword_replies {
            if let Some(slot) = keyword_replies.iter_mut().find(|(k, _)| k == key) {
                slot.1 = value.clone();
            } else {
                keyword_replies.push((key.clone(), value.clone()));
            }
        }
        keyword_replies.sort_by(|(a, _), (b, _)| b.chars().count().cmp(&a.chars().count()));

        Self {
            intent: IntentParser::new(
                &[],
                &messages.fulfillment.order_intent_keywords,
            ),
            keyword_replies,
            outbound: OutboundPolicy::new(&messages.outbound),
            followup: FollowupPolicy::new(&messages.followup),
            quote_config: config.quote.clone(),
            config: messages,
            compliance,
            store,
            quote_engine,
            ws,
            dom,
        }
    }

    pub fn store(&self) -> Arc<WorkflowStore> {
        Arc::clone(&self.store)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    // ── reply composition ──

    pub fn generate_reply(&self, message_text: &str, item_title: &str) -> String {
        let lowered = message_text.trim().to_lowercase();
        let mut reply = self
            .keyword_replies
            .iter()
            .find(|(key, _)| !key.is_empty() && lowered.contains(&key.to_lowercase()))
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        if reply.is_empty() {
            reply = self.config.default_reply.clone();
        }
        if reply.is_empty() && self.config.force_non_empty_reply {
            reply = if self.config.non_empty_reply_fallback.is_empty() {
                DEFAULT_FORMAT_HINT.to_string()
            } else {
                self.config.non_empty_reply_fallback.clone()
            };
        }

        if !item_title.is_empty() {
            reply = format!("关于「{item_title}」，{reply}");
        }
        if !self.config.reply_prefix.is_empty() {
            reply = format!("{}{reply}", self.config.reply_prefix);
        }
        reply
    }

    fn format_hint_reply(&self) -> String {
        if self.config.non_empty_reply_fallback.contains("询价格式") {
            self.config.non_empty_reply_fallback.clone()
        } else {
            DEFAULT_FORMAT_HINT.to_string()
        }
    }

    fn order_ack_reply(&self, item_title: &str) -> String {
        let template = if self.config.fulfillment.ack_template.trim().is_empty() {
            DEFAULT_ORDER_ACK
        } else {
            self.config.fulfillment.ack_template.trim()
        };
        template.replace(
            "{item_title}",
            if item_title.is_empty() { "商品" } else { item_title },
        )
    }

    fn checkout_guide_reply(&self, courier: &str) -> String {
        format!(
            "好的，按{courier}给你安排。请先拍下链接完成下单，无需提供单号，我这边确认后直接联系揽收。"
        )
    }

    fn compose_quote_reply(&self, result: &QuoteResult) -> (String, Vec<String>) {
        let options = result
            .explain
            .get("courier_options")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        if self.config.quote_reply_all_couriers && options.len() > 1 {
            let eta_days = QuoteResult::format_eta_days(result.eta_minutes);
            let mut lines = vec!["可选快递报价：".to_string()];
            let mut couriers = Vec::new();
            for option in &options {
                let courier = option["courier"].as_str().unwrap_or("").to_string();
                let total = option["total_fee"].as_f64().unwrap_or(0.0);
                let first = option["first_cost"].as_f64().unwrap_or(0.0);
                let extra = option["extra_cost"].as_f64().unwrap_or(0.0);
                lines.push(format!(
                    "- {courier} ¥{total:.2}（首重 ¥{first:.2} + 续重 ¥{extra:.2}/kg）"
                ));
                couriers.push(courier);
            }
            lines.push(format!("预计时效约 {eta_days}，回我快递名就按那家发。"));
            (lines.join("\n"), couriers)
        } else {
            let template = self
                .config
                .quote_reply_template
                .as_deref()
                .unwrap_or(SINGLE_COURIER_QUOTE_TEMPLATE);
            let reply = result.compose_reply(Some(template), self.quote_engine.validity_minutes());
            let courier = result
                .explain_str("matched_courier")
                .or_else(|| result.explain_str("courier"))
                .unwrap_or_default()
                .to_string();
            let couriers = if courier.is_empty() || courier == "auto" {
                Vec::new()
            } else {
                vec![courier]
            };
            (reply, couriers)
        }
    }

    // ── transports ──

    async fn unread_via_transports(&self, limit: usize) -> Vec<InboundSession> {
        match self.config.transport {
            TransportMode::Ws => match &self.ws {
                Some(ws) => ws.get_unread_sessions(limit).await,
                None => Vec::new(),
            },
            TransportMode::Dom => match &self.dom {
                Some(dom) => dom.get_unread_sessions(limit).await,
                None => Vec::new(),
            },
            TransportMode::Auto => {
                if let Some(ws) = &self.ws {
                    let sessions = ws.get_unread_sessions(limit).await;
                    if !sessions.is_empty() || ws.is_ready() {
                        return sessions;
                    }
                }
                match &self.dom {
                    Some(dom) => dom.get_unread_sessions(limit).await,
                    None => Vec::new(),
                }
            }
        }
    }

    async fn send_via_transports(&self, session_id: &str, text: &str) -> bool {
        match self.config.transport {
            TransportMode::Ws => match &self.ws {
                Some(ws) => ws.send_text(session_id, text).await,
                None => false,
            },
            TransportMode::Dom => match &self.dom {
                Some(dom) => dom.send_text(session_id, text).await,
                None => false,
            },
            TransportMode::Auto => {
                if let Some(ws) = &self.ws {
                    if ws.send_text(session_id, text).await {
                        return true;
                    }
                    debug!(session_id, "ws send failed, falling back to dom");
                }
                match &self.dom {
                    Some(dom) => dom.send_text(session_id, text).await,
                    None => false,
                }
            }
        }
    }

    // ── outbound pipeline ──

    /// Compliance gate, cooldown policy, then transport. Blocks come back
    /// as descriptor fields, never errors.
    async fn deliver(
        &self,
        outcome: &mut ProcessOutcome,
        actor: &str,
        dry_run: bool,
    ) {
        let session_id = outcome.session_id.clone();
        let decision = self.compliance.evaluate_before_send(
            &outcome.reply,
            actor,
            Some(&self.config.account_id),
            Some(&session_id),
            "message_send",
        );
        if decision.blocked {
            outcome.blocked_by_policy = true;
            outcome.block_reason = Some(decision.reason.clone());
            if outcome.is_quote {
                outcome.quote_blocked_by_policy = true;
            }
            let _ = self.store.update_context(&session_id, |ctx| {
                OutboundPolicy::note_blocked(ctx, &decision.reason);
            });
            info!(session_id = %session_id, reason = %decision.reason, "outbound blocked by compliance");
            return;
        }

        let now = Self::now();
        let context = self.store.get_context(&session_id).unwrap_or_default();
        let (allowed, reason) = self
            .outbound
            .evaluate(&session_id, &outcome.reply, &context, now);
        if !allowed {
            outcome.block_reason = Some(reason.clone());
            let _ = self.store.update_context(&session_id, |ctx| {
                OutboundPolicy::note_blocked(ctx, &reason);
            });
            debug!(session_id = %session_id, reason = %reason, "outbound blocked by cooldown policy");
            return;
        }

        if dry_run {
            outcome.sent = true;
            return;
        }

        if self.send_via_transports(&session_id, &outcome.reply).await {
            outcome.sent = true;
            let first_reply = context.first_reply_at.is_none();
            outcome.first_reply_sent = first_reply;
            let _ = self.store.update_context(&session_id, |ctx| {
                OutboundPolicy::note_sent(ctx, now);
                if ctx.first_reply_at.is_none() {
                    ctx.first_reply_at = Some(now);
                }
            });
        } else {
            outcome.block_reason = Some("send_failed".into());
        }
    }

    /// Operator-facing workflow transition; `force` bypasses the table and
    /// is audited as `forced`.
    pub fn transition_stage(
        &self,
        session_id: &str,
        stage: crate::workflow::state::WorkflowState,
        force: bool,
    ) -> Result<bool> {
        if force {
            self.store.force_state(session_id, stage, "operator", None)?;
            Ok(true)
        } else {
            Ok(self
                .store
                .transition_state(session_id, stage, "operator", None)?)
        }
    }

    pub async fn reply_to_session(&self, session_id: &str, text: &str) -> bool {
        let mut outcome = ProcessOutcome {
            session_id: session_id.to_string(),
            reply: text.to_string(),
            ..ProcessOutcome::default()
        };
        self.deliver(&mut outcome, "manual", false).await;
        outcome.sent
    }

    // ── quote flow ──

    async fn handle_quote(
        &self,
        session: &InboundSession,
        context: &SessionContext,
        greeting: bool,
        outcome: &mut ProcessOutcome,
    ) -> Result<()> {
        outcome.is_quote = true;
        let parsed = self.intent.parse_quote(&session.last_message);

        let remember = self.config.context_memory_enabled;
        let origin = parsed
            .origin
            .clone()
            .or_else(|| remember.then(|| context.pending_origin.clone()).flatten());
        let destination = parsed
            .destination
            .clone()
            .or_else(|| remember.then(|| context.pending_destination.clone()).flatten());
        let weight_kg = parsed
            .weight_kg
            .or_else(|| remember.then_some(context.pending_weight_kg).flatten());
        let volume_cc = parsed
            .volume_cc
            .or_else(|| remember.then_some(context.pending_volume_cc).flatten());
        let volume_weight_kg = parsed
            .volume_weight_kg
            .or_else(|| remember.then_some(context.pending_volume_weight_kg).flatten());

        if destination.is_none() || weight_kg.is_none() {
            outcome.quote_need_info = true;
            outcome.format_enforced = true;
            outcome.format_enforced_reason =
                Some(if greeting { "greeting" } else { "missing_fields" }.into());
            outcome.reply = self.format_hint_reply();

            if remember {
                let _ = self.store.update_context(&session.session_id, |ctx| {
                    if origin.is_some() {
                        ctx.pending_origin = origin.clone();
                    }
                    if destination.is_some() {
                        ctx.pending_destination = destination.clone();
                    }
                    if weight_kg.is_some() {
                        ctx.pending_weight_kg = weight_kg;
                    }
                    if volume_cc.is_some() {
                        ctx.pending_volume_cc = volume_cc;
                    }
                    if volume_weight_kg.is_some() {
                        ctx.pending_volume_weight_kg = volume_weight_kg;
                    }
                });
            }
            return Ok(());
        }

        let request = QuoteRequest {
            origin: origin.unwrap_or_else(|| self.quote_config.origin_city.clone()),
            destination: destination.unwrap_or_default(),
            weight_kg: weight_kg.unwrap_or(1.0),
            volume_cc: volume_cc.unwrap_or(0.0),
            volume_weight_kg: volume_weight_kg.unwrap_or(0.0),
            service_level: if parsed.urgent { "urgent" } else { "standard" }.into(),
            courier: parsed
                .courier
                .clone()
                .or_else(|| context.locked_courier.clone())
                .unwrap_or_else(|| "auto".into()),
            item_type: "general".into(),
            time_window: "normal".into(),
        };

        let result = self
            .quote_engine
            .get_quote(&request)
            .await
            .map_err(|e| anyhow::anyhow!("quote failed: {e}"))?;
        outcome.quote_fallback = result.fallback_used;

        let (reply, quoted_couriers) = self.compose_quote_reply(&result);
        outcome.reply = reply;

        let _ = self.store.update_context(&session.session_id, |ctx| {
            ctx.pending_origin = None;
            ctx.pending_destination = None;
            ctx.pending_weight_kg = None;
            ctx.pending_volume_cc = None;
            ctx.pending_volume_weight_kg = None;
            if !quoted_couriers.is_empty() {
                ctx.quoted_couriers = quoted_couriers.clone();
            }
        });
        Ok(())
    }

    // ── follow-up pass ──

    /// One read-no-reply sweep over recently replied/quoted sessions.
    pub async fn run_followup_pass(&self, limit: usize, dry_run: bool) -> FollowupReport {
        let mut report = FollowupReport::default();
        if !self.followup.is_enabled() {
            return report;
        }
        let candidates = match self.store.list_followup_candidates(limit) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "followup candidate query failed");
                return report;
            }
        };

        for task in candidates {
            let context = self.store.get_context(&task.session_id).unwrap_or_default();
            let now = Self::now();
            let (eligible, _reason) = self.followup.evaluate(
                &task.session_id,
                context.last_inbound_message.as_deref().unwrap_or(""),
                &context,
                now,
            );
            if !eligible {
                report.skipped += 1;
                continue;
            }
            report.eligible += 1;

            let mut outcome = ProcessOutcome {
                session_id: task.session_id.clone(),
                reply: self
                    .followup
                    .build_message(&context, &task.last_peer_name, &task.last_item_title),
                ..ProcessOutcome::default()
            };
            self.deliver(&mut outcome, "followup", dry_run).await;
            if outcome.sent {
                report.success += 1;
                let _ = self.store.update_context(&task.session_id, |ctx| {
                    FollowupPolicy::note_followup_sent(ctx, now);
                });
                let _ = self.store.transition_state(
                    &task.session_id,
                    crate::workflow::state::WorkflowState::Followed,
                    "read_no_reply_followup",
                    None,
                );
            }
        }
        report
    }

    // ── batch surface ──

    pub async fn auto_reply_unread(&self, limit: usize, dry_run: bool) -> AutoReplyReport {
        let unread = self.unread_sessions(limit).await;
        let unread: Vec<InboundSession> = unread
            .into_iter()
            .take(self.config.max_replies_per_run.max(1))
            .collect();

        let mut details = Vec::new();
        let mut success = 0usize;
        let mut quote_total = 0usize;
        let mut quote_attempted = 0usize;
        let mut quote_success = 0usize;

        for session in &unread {
            let outcome = match self.process_session(session, dry_run, "auto_reply").await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "session processing failed");
                    ProcessOutcome {
                        session_id: session.session_id.clone(),
                        last_message: session.last_message.clone(),
                        block_reason: Some(e.to_string()),
                        dry_run,
                        ..ProcessOutcome::default()
                    }
                }
            };
            if outcome.sent {
                success += 1;
            }
            if outcome.is_quote {
                quote_total += 1;
                if !outcome.quote_need_info {
                    quote_attempted += 1;
                    if outcome.quote_success {
                        quote_success += 1;
                    }
                }
            }
            details.push(outcome);
        }

        AutoReplyReport {
            action: "auto_reply_unread",
            total: unread.len(),
            success,
            failed: unread.len() - success,
            dry_run,
            quote_total,
            quote_success_rate: if quote_attempted == 0 {
                0.0
            } else {
                quote_success as f64 / quote_attempted as f64
            },
            details,
        }
    }
}

#[async_trait]
impl SessionProcessor for MessageService {
    async fn unread_sessions(&self, limit: usize) -> Vec<InboundSession> {
        self.unread_via_transports(limit).await
    }

    async fn followup_pass(&self, limit: usize, dry_run: bool) -> FollowupReport {
        self.run_followup_pass(limit, dry_run).await
    }

    async fn process_session(
        &self,
        session: &InboundSession,
        dry_run: bool,
        actor: &str,
    ) -> Result<ProcessOutcome> {
        let text = session.last_message.trim().to_string();
        let mut outcome = ProcessOutcome {
            session_id: session.session_id.clone(),
            peer_name: session.peer_name.clone(),
            last_message: text.clone(),
            dry_run,
            ..ProcessOutcome::default()
        };
        let context = self.store.get_context(&session.session_id).unwrap_or_default();

        // 1. Order confirmation.
        if self.config.fulfillment.enabled && self.intent.is_order_intent(&text) {
            outcome.is_order_intent = true;
            outcome.reply = self.order_ack_reply(&session.item_title);
        }
        // 2. Courier choice against the previously quoted list.
        else if let Some(courier) = self.intent.chosen_courier(&text, &context.quoted_couriers) {
            outcome.courier_locked = true;
            outcome.reply = self.checkout_guide_reply(&courier);
            let _ = self.store.update_context(&session.session_id, |ctx| {
                ctx.courier_locked = true;
                ctx.locked_courier = Some(courier.clone());
            });
        }
        // 3. Quote intent (keywords, strict-format mode, or bare greeting).
        else {
            let greeting = IntentParser::is_greeting(&text);
            let quote_intent = self.intent.is_quote_request(&text);
            let has_pending_context = self.config.context_memory_enabled
                && context.pending_destination.is_some()
                && IntentParser::extract_weight_kg(&text).is_some();
            if quote_intent
                || greeting
                || has_pending_context
                || self.config.strict_format_reply_enabled
            {
                self.handle_quote(session, &context, greeting, &mut outcome)
                    .await?;
            } else {
                // 4. Keyword template / default reply.
                outcome.reply = self.generate_reply(&text, &session.item_title);
            }
        }

        let _ = self.store.update_context(&session.session_id, |ctx| {
            ctx.last_inbound_message = Some(text.clone());
        });

        self.deliver(&mut outcome, actor, dry_run).await;
        if outcome.is_quote && !outcome.quote_need_info {
            outcome.quote_success = outcome.sent && !outcome.quote_blocked_by_policy;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::CostTableRepository;

    struct Fixture {
        _dir: tempfile::TempDir,
        policy_path: std::path::PathBuf,
        service: MessageService,
    }

    fn fixture(mutate: impl FnOnce(&mut AppConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.messages.workflow.db_path = dir
            .path()
            .join("workflow.db")
            .to_string_lossy()
            .to_string();
        config.compliance.policy_path = dir
            .path()
            .join("compliance_policies.yaml")
            .to_string_lossy()
            .to_string();
        config.compliance.db_path = dir
            .path()
            .join("compliance.db")
            .to_string_lossy()
            .to_string();
        config.quote.snapshot_db_path = dir
            .path()
            .join("quote_snapshots.db")
            .to_string_lossy()
            .to_string();
        config.quote.cost_table_dir = dir.path().join("tables").to_string_lossy().to_string();
        mutate(&mut config);

        let store = Arc::new(WorkflowStore::open(&config.messages.workflow.db_path).unwrap());
        let compliance = Arc::new(
            ComplianceCenter::open(&config.compliance.policy_path, &config.compliance.db_path)
                .unwrap(),
        );
        let cost_table = Arc::new(CostTableRepository::new(&config.quote.cost_table_dir));
        let quote_engine = Arc::new(AutoQuoteEngine::new(&config.quote, cost_table).unwrap());
        let policy_path = std::path::PathBuf::from(&config.compliance.policy_path);
        let service = MessageService::new(&config, store, compliance, quote_engine, None, None);
        Fixture {
            _dir: dir,
            policy_path,
            service,
        }
    }

    fn session(id: &str, message: &str) -> InboundSession {
        InboundSession {
            session_id: id.into(),
            peer_name: "买家".into(),
            item_title: "快递服务".into(),
            last_message: message.into(),
            unread_count: 1,
            sender_user_id: "peer_1".into(),
            create_time: 0,
            source: "test".into(),
        }
    }

    #[test]
    fn keyword_reply_uses_template_and_prefix() {
        let f = fixture(|cfg| {
            cfg.messages.reply_prefix = "【自动回复】".into();
        });
        let reply = f.service.generate_reply("还在吗？", "");
        assert!(reply.contains("在的"));
        assert!(reply.starts_with("【自动回复】"));
    }

    #[test]
    fn virtual_goods_keyword_reply_includes_item_title() {
        let f = fixture(|_| {});
        let reply = f.service.generate_reply("这个多久发卡密？", "流媒体会员卡密");
        assert!(reply.contains("虚拟商品"));
        assert!(reply.contains("关于「流媒体会员卡密」"));
    }

    #[test]
    fn blank_default_reply_forces_non_empty_fallback() {
        let f = fixture(|cfg| {
            cfg.messages.default_reply = String::new();
            cfg.messages.non_empty_reply_fallback =
                "询价格式：xx省 - xx省 - 重量（kg）\n长宽高（单位cm）".into();
        });
        let reply = f.service.generate_reply("随便问问", "");
        assert!(reply.contains("询价格式"));
    }

    #[tokio::test]
    async fn complete_quote_request_generates_quote() {
        let f = fixture(|_| {});
        let outcome = f
            .service
            .process_session(&session("q1", "从上海寄到杭州 2kg 多少钱"), true, "test")
            .await
            .unwrap();
        assert!(outcome.is_quote);
        assert!(outcome.quote_success);
        assert!(outcome.reply.contains("首单价格") || outcome.reply.contains("可选快递报价"));
        assert!(outcome.reply.contains("预计"));
    }

    #[tokio::test]
    async fn missing_fields_returns_format_hint() {
        let f = fixture(|_| {});
        let outcome = f
            .service
            .process_session(&session("q2", "寄到北京运费多少"), true, "test")
            .await
            .unwrap();
        assert!(outcome.is_quote);
        assert!(outcome.quote_need_info);
        assert!(!outcome.quote_success);
        assert!(outcome.reply.contains("询价格式"));
        assert_eq!(outcome.format_enforced_reason.as_deref(), Some("missing_fields"));
    }

    #[tokio::test]
    async fn strict_mode_forces_format_template() {
        let f = fixture(|cfg| {
            cfg.messages.strict_format_reply_enabled = true;
        });
        let outcome = f
            .service
            .process_session(&session("q_strict", "在吗"), true, "test")
            .await
            .unwrap();
        assert!(outcome.is_quote);
        assert!(outcome.quote_need_info);
        assert!(outcome.format_enforced);
        assert!(outcome.reply.contains("询价格式"));
    }

    #[tokio::test]
    async fn non_strict_keeps_general_reply_for_non_quote() {
        let f = fixture(|cfg| {
            cfg.messages.strict_format_reply_enabled = false;
        });
        let outcome = f
            .service
            .process_session(&session("q_ns", "这个商品有货吗"), true, "test")
            .await
            .unwrap();
        assert!(!outcome.is_quote);
        assert!(!outcome.reply.contains("询价格式"));
    }

    #[tokio::test]
    async fn greeting_forces_format_even_non_strict() {
        let f = fixture(|_| {});
        let outcome = f
            .service
            .process_session(&session("q_greet", "你好"), true, "test")
            .await
            .unwrap();
        assert!(outcome.is_quote);
        assert!(outcome.quote_need_info);
        assert!(outcome.format_enforced);
        assert_eq!(outcome.format_enforced_reason.as_deref(), Some("greeting"));
        assert!(outcome.reply.contains("询价格式"));
    }

    #[tokio::test]
    async fn context_memory_completes_partial_quote() {
        let f = fixture(|_| {});
        let first = f
            .service
            .process_session(&session("ctx1", "从上海寄到杭州 多少钱"), true, "test")
            .await
            .unwrap();
        assert!(first.is_quote);
        assert!(first.quote_need_info);
        assert!(!first.quote_success);

        let second = f
            .service
            .process_session(&session("ctx1", "2kg"), true, "test")
            .await
            .unwrap();
        assert!(second.is_quote);
        assert!(second.quote_success, "{:?}", second);
        assert!(
            second.reply.contains("可选快递报价") || second.reply.contains("首单价格")
        );
    }

    #[tokio::test]
    async fn courier_choice_returns_checkout_guide() {
        let f = fixture(|_| {});
        let quoted = f
            .service
            .process_session(&session("ord1", "从上海寄到杭州 2kg 多少钱"), true, "test")
            .await
            .unwrap();
        assert!(quoted.quote_success);

        // Seed the quoted courier list if the builtin tariff had no table
        // options to surface.
        f.service
            .store
            .update_context("ord1", |ctx| {
                if ctx.quoted_couriers.is_empty() {
                    ctx.quoted_couriers = vec!["圆通".into(), "中通".into()];
                }
            })
            .unwrap();

        let choose = f
            .service
            .process_session(&session("ord1", "选圆通"), true, "test")
            .await
            .unwrap();
        assert!(!choose.is_quote);
        assert!(choose.courier_locked);
        assert!(choose.reply.contains("先拍下链接"));
        assert!(choose.reply.contains("无需提供"));
    }

    #[tokio::test]
    async fn order_intent_returns_ack_template() {
        let f = fixture(|_| {});
        let outcome = f
            .service
            .process_session(&session("o1", "我已付款，麻烦安排"), true, "test")
            .await
            .unwrap();
        assert!(outcome.is_order_intent);
        assert!(outcome.reply.contains("收到你的订单"));
    }

    #[tokio::test]
    async fn compliance_block_suppresses_quote_success() {
        let f = fixture(|_| {});
        // Quote replies carry "首单价格"; stop-word it so the composed reply
        // is blocked on the way out.
        std::fs::write(
            &f.policy_path,
            "global:\n  stop_words: [\"首单价格\", \"询价格式\"]\n",
        )
        .unwrap();
        f.service.compliance.reload();

        let outcome = f
            .service
            .process_session(&session("q3", "从上海寄到杭州 2kg 多少钱"), false, "test")
            .await
            .unwrap();
        assert!(outcome.is_quote);
        assert!(outcome.blocked_by_policy);
        assert!(outcome.quote_blocked_by_policy);
        assert!(!outcome.quote_success);
        assert!(!outcome.sent);
    }
}
