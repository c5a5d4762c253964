//! End-to-end workflow scenarios over a scripted transport: inbound events
//! flow through intent classification, the quote engine, compliance, the
//! job queue, and back out as sends, with state transitions and SLA events
//! recorded on the way.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use idlebot_backend::compliance::ComplianceCenter;
use idlebot_backend::config::{AppConfig, QuoteMode, RemoteProviderConfig, TransportMode};
use idlebot_backend::messages::service::SessionProcessor;
use idlebot_backend::messages::MessageService;
use idlebot_backend::quote::models::QuoteRequest;
use idlebot_backend::quote::{AutoQuoteEngine, CostTableRepository};
use idlebot_backend::transport::{ChatTransport, InboundSession};
use idlebot_backend::workflow::{WorkflowState, WorkflowStore, WorkflowWorker};

/// Scripted in-memory transport: test-seeded inbound, recorded outbound.
#[derive(Default)]
struct ScriptedTransport {
    inbound: Mutex<Vec<InboundSession>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    fn push_inbound(&self, session: InboundSession) {
        self.inbound.lock().push(session);
    }

    fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn start(&self) {}
    async fn stop(&self) {}

    fn is_ready(&self) -> bool {
        true
    }

    async fn get_unread_sessions(&self, limit: usize) -> Vec<InboundSession> {
        let mut inbound = self.inbound.lock();
        let take = inbound.len().min(limit.max(1));
        inbound.drain(..take).collect()
    }

    async fn send_text(&self, session_id: &str, text: &str) -> bool {
        self.sent
            .lock()
            .push((session_id.to_string(), text.to_string()));
        true
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    transport: Arc<ScriptedTransport>,
    store: Arc<WorkflowStore>,
    compliance: Arc<ComplianceCenter>,
    service: Arc<MessageService>,
    worker: WorkflowWorker,
    policy_path: std::path::PathBuf,
}

fn harness(mutate: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = |name: &str| dir.path().join(name).to_string_lossy().to_string();

    let mut config = AppConfig::default();
    config.messages.transport = TransportMode::Ws;
    // Tests send back-to-back within the same second.
    config.messages.outbound.min_interval_seconds = 0;
    config.messages.workflow.db_path = path("workflow.db");
    config.messages.workflow.state_path = path("workflow_worker_state.json");
    config.messages.workflow.sla.metrics_path = path("workflow_sla_metrics.json");
    config.compliance.policy_path = path("compliance_policies.yaml");
    config.compliance.db_path = path("compliance.db");
    config.quote.snapshot_db_path = path("quote_snapshots.db");
    config.quote.cost_table_dir = path("cost_tables");
    mutate(&mut config);

    let store = Arc::new(WorkflowStore::open(&config.messages.workflow.db_path).unwrap());
    let compliance = Arc::new(
        ComplianceCenter::open(&config.compliance.policy_path, &config.compliance.db_path)
            .unwrap(),
    );
    let cost_table = Arc::new(CostTableRepository::new(&config.quote.cost_table_dir));
    let engine = Arc::new(AutoQuoteEngine::new(&config.quote, cost_table).unwrap());
    let transport = Arc::new(ScriptedTransport::default());

    let service = Arc::new(MessageService::new(
        &config,
        Arc::clone(&store),
        Arc::clone(&compliance),
        engine,
        Some(Arc::clone(&transport) as Arc<dyn ChatTransport>),
        None,
    ));
    let worker = WorkflowWorker::new(
        Arc::clone(&service) as Arc<dyn SessionProcessor>,
        Arc::clone(&store),
        &config.messages.workflow,
    );

    Harness {
        policy_path: std::path::PathBuf::from(&config.compliance.policy_path),
        _dir: dir,
        transport,
        store,
        compliance,
        service,
        worker,
    }
}

fn inbound(session_id: &str, peer: &str, message: &str) -> InboundSession {
    InboundSession {
        session_id: session_id.into(),
        peer_name: "买家".into(),
        item_title: "快递服务".into(),
        last_message: message.into(),
        unread_count: 1,
        sender_user_id: peer.into(),
        create_time: 0,
        source: "ws".into(),
    }
}

#[tokio::test]
async fn plain_quote_replies_and_moves_to_quoted() {
    let h = harness(|_| {});
    h.transport
        .push_inbound(inbound("q1", "P1", "从上海寄到杭州 2kg 多少钱"));

    let report = h.worker.run_once(false).await.unwrap();
    assert_eq!(report.success, 1);

    let sent = h.transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "q1");
    assert!(sent[0].1.contains("首单价格") || sent[0].1.contains("可选快递报价"));
    assert!(sent[0].1.contains("预计"));

    let task = h.store.get_session("q1").unwrap().unwrap();
    assert_eq!(task.state, WorkflowState::Quoted);

    let sla = h.store.sla_summary(60).unwrap();
    assert_eq!(sla.quote_total, 1);
    assert!((sla.quote_success_rate - 1.0).abs() < 1e-9);

    // Outbound send was preceded by exactly one audit row for the session.
    assert_eq!(h.compliance.audit_count("q1", "message_send").unwrap(), 1);
}

#[tokio::test]
async fn missing_fields_get_format_hint_and_replied_state() {
    let h = harness(|_| {});
    h.transport.push_inbound(inbound("q2", "P2", "寄到北京运费多少"));

    let report = h.worker.run_once(false).await.unwrap();
    assert_eq!(report.success, 1);

    let sent = h.transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("询价格式"));

    let task = h.store.get_session("q2").unwrap().unwrap();
    assert_eq!(task.state, WorkflowState::Replied);
}

#[tokio::test]
async fn order_confirmation_moves_quoted_session_to_ordered() {
    let h = harness(|_| {});
    h.transport
        .push_inbound(inbound("q1", "P1", "从上海寄到杭州 2kg 多少钱"));
    h.worker.run_once(false).await.unwrap();
    assert_eq!(
        h.store.get_session("q1").unwrap().unwrap().state,
        WorkflowState::Quoted
    );

    h.transport
        .push_inbound(inbound("q1", "P1", "我已付款，麻烦安排"));
    h.worker.run_once(false).await.unwrap();

    let sent = h.transport.sent_messages();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].1.contains("收到你的订单"));
    assert_eq!(
        h.store.get_session("q1").unwrap().unwrap().state,
        WorkflowState::Ordered
    );
}

#[tokio::test]
async fn stop_word_blocks_send_and_audits_hit() {
    let h = harness(|_| {});
    std::fs::write(&h.policy_path, "global:\n  stop_words: [\"微信\"]\n").unwrap();
    h.compliance.reload();

    let sent = h.service.reply_to_session("s_block", "可以加我微信聊").await;
    assert!(!sent);
    assert!(h.transport.sent_messages().is_empty());

    let rows = h
        .compliance
        .replay(None, Some("s_block"), true, 10)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].decision, "high_risk_stop_word");
    assert_eq!(rows[0].hits, vec!["微信".to_string()]);
}

#[tokio::test]
async fn blocked_quote_does_not_count_as_quote_success() {
    let h = harness(|_| {});
    std::fs::write(
        &h.policy_path,
        "global:\n  stop_words: [\"首单价格\", \"可选快递报价\"]\n",
    )
    .unwrap();
    h.compliance.reload();

    h.transport
        .push_inbound(inbound("q3", "P3", "从上海寄到杭州 2kg 多少钱"));
    let report = h.worker.run_once(false).await.unwrap();
    assert_eq!(report.success, 0);
    assert!(h.transport.sent_messages().is_empty());

    let sla = h.store.sla_summary(60).unwrap();
    assert_eq!(sla.quote_total, 0);
}

#[tokio::test]
async fn circuit_breaker_fallback_chain_matches_contract() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.quote.mode = QuoteMode::Hybrid;
    config.quote.retry_times = 1;
    config.quote.circuit_fail_threshold = 1;
    config.quote.remote = RemoteProviderConfig {
        enabled: true,
        simulated_latency_ms: 0,
        failure_rate: 1.0,
    };
    config.quote.snapshot_db_path = dir
        .path()
        .join("quote_snapshots.db")
        .to_string_lossy()
        .to_string();
    config.quote.cost_table_dir = dir.path().join("tables").to_string_lossy().to_string();
    let cost_table = Arc::new(CostTableRepository::new(&config.quote.cost_table_dir));
    let engine = Arc::new(AutoQuoteEngine::new(&config.quote, cost_table).unwrap());

    let r1 = engine
        .get_quote(&QuoteRequest::new("上海", "杭州", 1.0))
        .await
        .unwrap();
    assert!(r1.fallback_used);
    let s1 = r1.snapshot.unwrap();
    assert!(
        s1.fallback_reason.contains("Remote provider temporary failure")
            || s1.fallback_reason.contains("Remote provider timeout")
    );

    let r2 = engine
        .get_quote(&QuoteRequest::new("上海", "南京", 2.0))
        .await
        .unwrap();
    assert!(r2.fallback_used);
    let s2 = r2.snapshot.unwrap();
    assert_eq!(s2.provider_chain, vec!["hot_cache_miss", "cost_table"]);
}

#[tokio::test]
async fn duplicate_inbound_content_enqueues_one_job() {
    let h = harness(|_| {});
    h.transport.push_inbound(inbound("d1", "P1", "还在吗"));
    h.transport.push_inbound(inbound("d1", "P1", "还在吗"));

    let report = h.worker.run_once(false).await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(h.transport.sent_messages().len(), 1);
}

#[tokio::test]
async fn crash_recovery_reclaims_expired_lease() {
    let h = harness(|_| {});
    h.store
        .enqueue_job(&inbound("r1", "P1", "还在吗"), "reply")
        .unwrap();
    let job_id = h.store.claim_jobs(1, 30).unwrap()[0].id;
    h.store.seed_job_status(job_id, "running", Some(-60)).unwrap();

    assert_eq!(h.store.recover_expired_jobs().unwrap(), 1);
    let record = h.store.job_record(job_id).unwrap().unwrap();
    assert_eq!(record.status, "pending");
    assert!(record.lease_until.is_none());

    let reclaimed = h.store.claim_jobs(10, 30).unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, job_id);
}

#[tokio::test]
async fn manual_takeover_suppresses_automated_replies() {
    let h = harness(|_| {});
    h.store
        .ensure_session(&inbound("m1", "P1", "还在吗"))
        .unwrap();
    h.store.set_manual_takeover("m1", true).unwrap();

    h.transport.push_inbound(inbound("m1", "P1", "还在吗"));
    let report = h.worker.run_once(false).await.unwrap();
    assert_eq!(report.skipped_manual, 1);
    assert!(h.transport.sent_messages().is_empty());
}
