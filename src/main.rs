//! Idlebot CLI.
//!
//! Every subcommand prints exactly one JSON document on stdout and exits
//! non-zero on error (`{"error": "..."}`); logs go to stderr so agent
//! callers can parse stdout directly.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use idlebot_backend::browser::BrowserClient;
use idlebot_backend::compliance::ComplianceCenter;
use idlebot_backend::config::{AppConfig, RuntimeMode, TransportMode};
use idlebot_backend::doctor;
use idlebot_backend::messages::service::SessionProcessor;
use idlebot_backend::messages::MessageService;
use idlebot_backend::quote::models::QuoteRequest;
use idlebot_backend::quote::{AutoQuoteEngine, CostTableRepository};
use idlebot_backend::transport::dom::DomTransport;
use idlebot_backend::transport::ws::GoofishWsTransport;
use idlebot_backend::transport::ChatTransport;
use idlebot_backend::workflow::worker::RunBounds;
use idlebot_backend::workflow::{WorkflowState, WorkflowStore, WorkflowWorker};

#[derive(Parser)]
#[command(name = "idlebot")]
#[command(about = "Goofish seller automation CLI - all commands emit a single JSON document")]
struct Cli {
    /// Path to config YAML (default: config/config.yaml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level for stderr diagnostics (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a listing draft via the browser gateway
    Publish(PublishArgs),
    /// Polish (refresh) listings
    Polish(PolishArgs),
    /// Update a listing price
    Price(PriceArgs),
    /// Take a listing offline
    Delist(IdArgs),
    /// Put a delisted listing back online
    Relist(IdArgs),
    /// Reports straight from the stores
    Analytics(AnalyticsArgs),
    /// Account summary and cookie health
    Accounts(AccountsArgs),
    /// Chat channel operations
    Messages(MessagesArgs),
    /// Module readiness and workflow operations
    Module(ModuleArgs),
    /// Compute a shipping quote
    Quote(QuoteArgs),
    /// Compliance audit replay and one-off checks
    Compliance(ComplianceArgs),
    /// Environment readiness report
    Doctor(DoctorArgs),
}

#[derive(Args)]
struct PublishArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    price: f64,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, num_args = 0..)]
    images: Vec<String>,
}

#[derive(Args)]
struct PolishArgs {
    /// Polish all listings up to --max
    #[arg(long)]
    all: bool,
    #[arg(long)]
    id: Option<String>,
    #[arg(long, default_value_t = 50)]
    max: usize,
}

#[derive(Args)]
struct PriceArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    price: f64,
}

#[derive(Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Args)]
struct AnalyticsArgs {
    /// sla | workflow | quotes
    #[arg(long)]
    action: String,
    #[arg(long, default_value_t = 60)]
    window_minutes: i64,
}

#[derive(Args)]
struct AccountsArgs {
    /// list | health
    #[arg(long)]
    action: String,
}

#[derive(Args)]
struct MessagesArgs {
    /// list-unread | reply | auto-reply | sla-benchmark | worker
    #[arg(long)]
    action: String,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    text: Option<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    max_cycles: Option<u64>,
    #[arg(long)]
    max_runtime_seconds: Option<f64>,
    #[arg(long)]
    interval_seconds: Option<f64>,
}

#[derive(Args)]
struct ModuleArgs {
    /// check | summary | takeover | transition
    #[arg(long)]
    action: String,
    /// presales | operations | aftersales | all
    #[arg(long, default_value = "all")]
    target: String,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    stage: Option<String>,
    #[arg(long)]
    force: bool,
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    skip_gateway: bool,
}

#[derive(Args)]
struct QuoteArgs {
    #[arg(long)]
    origin: Option<String>,
    #[arg(long)]
    destination: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    weight: f64,
    /// Warm both cache tiers for `origin:destination` pairs (comma separated)
    #[arg(long)]
    prewarm: Option<String>,
    /// Provider and circuit-breaker health report
    #[arg(long)]
    health: bool,
    #[arg(long, default_value_t = 0.0)]
    volume_cc: f64,
    #[arg(long, default_value_t = 0.0)]
    volume_weight: f64,
    #[arg(long, default_value = "standard")]
    service_level: String,
    #[arg(long, default_value = "auto")]
    courier: String,
}

#[derive(Args)]
struct ComplianceArgs {
    /// replay | check
    #[arg(long)]
    action: String,
    #[arg(long)]
    account_id: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    blocked_only: bool,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Content to evaluate (check action)
    #[arg(long)]
    content: Option<String>,
}

#[derive(Args)]
struct DoctorArgs {
    #[arg(long)]
    skip_gateway: bool,
    #[arg(long)]
    skip_quote: bool,
}

fn json_out(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".into()));
}

/// Wired core services behind one constructor so every subcommand sees the
/// same dependency graph.
struct Services {
    store: Arc<WorkflowStore>,
    compliance: Arc<ComplianceCenter>,
    engine: Arc<AutoQuoteEngine>,
    service: Arc<MessageService>,
}

impl Services {
    fn build(config: &AppConfig, with_transports: bool) -> Result<Self> {
        let store = Arc::new(
            WorkflowStore::open(&config.messages.workflow.db_path)
                .context("open workflow store")?,
        );
        let compliance = Arc::new(
            ComplianceCenter::open(&config.compliance.policy_path, &config.compliance.db_path)
                .context("open compliance center")?,
        );
        let cost_table = Arc::new(CostTableRepository::new(&config.quote.cost_table_dir));
        let engine = Arc::new(
            AutoQuoteEngine::new(&config.quote, cost_table).context("init quote engine")?,
        );

        let mut ws: Option<Arc<dyn ChatTransport>> = None;
        let mut dom: Option<Arc<dyn ChatTransport>> = None;
        if with_transports {
            if config.messages.transport != TransportMode::Dom {
                let cookie = config.messages.resolve_cookie();
                match GoofishWsTransport::new(&cookie, config.messages.ws.clone()) {
                    Ok(transport) => ws = Some(Arc::new(transport)),
                    Err(e) => tracing::warn!(error = %e, "ws transport unavailable"),
                }
            }
            if config.messages.transport != TransportMode::Ws
                && config.runtime != RuntimeMode::Lite
            {
                match BrowserClient::new(&config.browser) {
                    Ok(client) => {
                        dom = Some(Arc::new(DomTransport::new(Arc::new(client))));
                    }
                    Err(e) => tracing::warn!(error = %e, "dom transport unavailable"),
                }
            }
        }

        let service = Arc::new(MessageService::new(
            config,
            Arc::clone(&store),
            Arc::clone(&compliance),
            Arc::clone(&engine),
            ws,
            dom,
        ));

        Ok(Self {
            store,
            compliance,
            engine,
            service,
        })
    }
}

async fn cmd_messages(config: &AppConfig, args: &MessagesArgs) -> Result<serde_json::Value> {
    let services = Services::build(config, true)?;
    match args.action.as_str() {
        "list-unread" => {
            let sessions = services.service.unread_sessions(args.limit).await;
            Ok(json!({"total": sessions.len(), "sessions": sessions}))
        }
        "reply" => {
            let (Some(session_id), Some(text)) = (&args.session_id, &args.text) else {
                anyhow::bail!("specify --session-id and --text");
            };
            let sent = services.service.reply_to_session(session_id, text).await;
            Ok(json!({"session_id": session_id, "reply": text, "success": sent}))
        }
        "auto-reply" => {
            let report = services
                .service
                .auto_reply_unread(args.limit, args.dry_run)
                .await;
            Ok(serde_json::to_value(report)?)
        }
        "sla-benchmark" => {
            let worker = WorkflowWorker::new(
                Arc::clone(&services.service) as Arc<dyn SessionProcessor>,
                services.store.clone(),
                &config.messages.workflow,
            );
            let cycles = args.max_cycles.unwrap_or(5);
            let mut reports = Vec::new();
            for _ in 0..cycles {
                reports.push(serde_json::to_value(worker.run_once(true).await?)?);
            }
            Ok(json!({
                "action": "messages_sla_benchmark",
                "cycles": cycles,
                "reports": reports,
                "sla": services.store.sla_summary(60)?,
            }))
        }
        "worker" => {
            let worker = Arc::new(WorkflowWorker::new(
                Arc::clone(&services.service) as Arc<dyn SessionProcessor>,
                services.store.clone(),
                &config.messages.workflow,
            ));
            let stopper = Arc::clone(&worker);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.stop();
                }
            });
            let summary = worker
                .run(
                    args.dry_run,
                    RunBounds {
                        max_cycles: args.max_cycles,
                        max_runtime_seconds: args.max_runtime_seconds,
                        interval_override_seconds: args.interval_seconds,
                    },
                )
                .await;
            Ok(summary)
        }
        other => anyhow::bail!("unknown messages action: {other}"),
    }
}

async fn cmd_quote(config: &AppConfig, args: &QuoteArgs) -> Result<serde_json::Value> {
    let services = Services::build(config, false)?;

    if args.health {
        return Ok(services.engine.health_check().await);
    }
    if let Some(raw) = &args.prewarm {
        let routes: Vec<(String, String)> = raw
            .split(',')
            .filter_map(|pair| {
                let (origin, destination) = pair.split_once(':')?;
                Some((origin.trim().to_string(), destination.trim().to_string()))
            })
            .collect();
        let warmed = services.engine.prewarm_cache(Some(routes.clone())).await;
        return Ok(json!({"action": "prewarm", "routes": routes.len(), "warmed": warmed}));
    }

    let Some(destination) = &args.destination else {
        anyhow::bail!("specify --destination (or --prewarm / --health)");
    };
    let request = QuoteRequest {
        origin: args
            .origin
            .clone()
            .unwrap_or_else(|| config.quote.origin_city.clone()),
        destination: destination.clone(),
        weight_kg: args.weight,
        volume_cc: args.volume_cc,
        volume_weight_kg: args.volume_weight,
        service_level: args.service_level.clone(),
        courier: args.courier.clone(),
        item_type: "general".into(),
        time_window: "normal".into(),
    };
    let result = services
        .engine
        .get_quote(&request)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(json!({"request": request, "result": result}))
}

async fn cmd_module(config: &AppConfig, args: &ModuleArgs) -> Result<serde_json::Value> {
    match args.action.as_str() {
        "check" => {
            let report = doctor::run_doctor(config, args.skip_gateway, false).await;
            let targets: Vec<&str> = if args.target == "all" {
                vec!["presales", "operations", "aftersales"]
            } else {
                vec![args.target.as_str()]
            };
            let mut modules = serde_json::Map::new();
            for target in targets {
                modules.insert(
                    target.to_string(),
                    module_check_summary(config, target, &report),
                );
            }
            Ok(json!({"action": "check", "modules": modules}))
        }
        "summary" => {
            let services = Services::build(config, false)?;
            Ok(json!({
                "workflow": services.store.workflow_summary()?,
                "sla": services.store.sla_summary(60)?,
            }))
        }
        "takeover" => {
            let Some(session_id) = &args.session_id else {
                anyhow::bail!("specify --session-id");
            };
            let enabled = args.enabled.unwrap_or(true);
            let services = Services::build(config, false)?;
            let changed = services.store.set_manual_takeover(session_id, enabled)?;
            Ok(json!({
                "session_id": session_id,
                "manual_takeover": enabled,
                "changed": changed,
            }))
        }
        "transition" => {
            let (Some(session_id), Some(stage)) = (&args.session_id, &args.stage) else {
                anyhow::bail!("specify --session-id and --stage");
            };
            let Some(state) = WorkflowState::parse(stage) else {
                anyhow::bail!("unknown stage: {stage}");
            };
            let services = Services::build(config, false)?;
            let applied = services
                .service
                .transition_stage(session_id, state, args.force)?;
            Ok(json!({
                "session_id": session_id,
                "stage": state.as_str(),
                "forced": args.force,
                "applied": applied,
                "transitions": services.store.get_transitions(session_id, 10)?,
            }))
        }
        other => anyhow::bail!("unknown module action: {other}"),
    }
}

/// Per-module readiness rollup. WS transport drops the browser-runtime
/// requirement for the chat-facing modules.
fn module_check_summary(
    config: &AppConfig,
    target: &str,
    report: &doctor::DoctorReport,
) -> serde_json::Value {
    let find = |name: &str| {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.passed)
            .unwrap_or(false)
    };
    let base_ok = find("data_dir_writable") && find("workflow_db") && find("compliance_db");
    let chat_needs_browser =
        config.messages.transport == TransportMode::Dom && target != "operations";
    let browser_ok = find("browser_gateway");
    let cookie_ok = find("session_cookie");

    let blocked = match target {
        "operations" => !base_ok || !browser_ok,
        _ => {
            // presales / aftersales ride the chat channel.
            !base_ok || !cookie_ok && config.messages.transport != TransportMode::Dom
                || (chat_needs_browser && !browser_ok)
        }
    };
    json!({
        "target": target,
        "blocked": blocked,
        "base_ok": base_ok,
        "cookie_ok": cookie_ok,
        "browser_ok": browser_ok,
    })
}

async fn cmd_compliance(config: &AppConfig, args: &ComplianceArgs) -> Result<serde_json::Value> {
    let services = Services::build(config, false)?;
    match args.action.as_str() {
        "replay" => {
            let rows = services.compliance.replay(
                args.account_id.as_deref(),
                args.session_id.as_deref(),
                args.blocked_only,
                args.limit,
            )?;
            Ok(json!({"total": rows.len(), "rows": rows}))
        }
        "check" => {
            let Some(content) = &args.content else {
                anyhow::bail!("specify --content");
            };
            let decision = services.compliance.evaluate_before_send(
                content,
                "cli",
                args.account_id.as_deref(),
                args.session_id.as_deref(),
                "cli_check",
            );
            Ok(serde_json::to_value(decision)?)
        }
        other => anyhow::bail!("unknown compliance action: {other}"),
    }
}

async fn cmd_analytics(config: &AppConfig, args: &AnalyticsArgs) -> Result<serde_json::Value> {
    let services = Services::build(config, false)?;
    match args.action.as_str() {
        "sla" => Ok(json!({
            "window_minutes": args.window_minutes,
            "sla": services.store.sla_summary(args.window_minutes)?,
        })),
        "workflow" => Ok(serde_json::to_value(services.store.workflow_summary()?)?),
        "quotes" => {
            let snapshots = services.engine.snapshot_store();
            Ok(json!({
                "stats": snapshots.stats()?,
                "recent": snapshots.recent(20)?,
            }))
        }
        other => anyhow::bail!("unknown analytics action: {other}"),
    }
}

async fn cmd_accounts(config: &AppConfig, args: &AccountsArgs) -> Result<serde_json::Value> {
    let cookie = config.messages.resolve_cookie();
    match args.action.as_str() {
        "list" => Ok(json!({
            "accounts": [{
                "account_id": config.messages.account_id,
                "transport": format!("{:?}", config.messages.transport).to_lowercase(),
                "cookie_present": !cookie.is_empty(),
            }],
        })),
        "health" => Ok(json!({
            "account_id": config.messages.account_id,
            "cookie": doctor::cookie_health(&cookie),
        })),
        other => anyhow::bail!("unknown accounts action: {other}"),
    }
}

// ── listing collaborator wrappers (browser gateway) ──

async fn gateway_page(config: &AppConfig) -> Result<(Arc<BrowserClient>, String)> {
    let client = Arc::new(BrowserClient::new(&config.browser)?);
    client.connect().await?;
    let page_id = client.new_page().await?;
    Ok((client, page_id))
}

async fn cmd_publish(config: &AppConfig, args: &PublishArgs) -> Result<serde_json::Value> {
    let (client, page_id) = gateway_page(config).await?;
    let result = async {
        client
            .navigate(&page_id, "https://www.goofish.com/publish")
            .await?;
        tokio::time::sleep(client.random_delay()).await;
        client.type_text(&page_id, "#title-input", &args.title).await;
        client
            .type_text(&page_id, "#desc-input", &args.description)
            .await;
        client
            .type_text(&page_id, "#price-input", &args.price.to_string())
            .await;
        Ok::<_, anyhow::Error>(json!({
            "action": "publish_draft",
            "title": args.title,
            "price": args.price,
            "images": args.images.len(),
            "submitted": false,
        }))
    }
    .await;
    client.close_page(&page_id).await;
    result
}

async fn cmd_polish(config: &AppConfig, args: &PolishArgs) -> Result<serde_json::Value> {
    if !args.all && args.id.is_none() {
        anyhow::bail!("specify --all or --id <product_id>");
    }
    let (client, page_id) = gateway_page(config).await?;
    let result = async {
        client
            .navigate(&page_id, "https://www.goofish.com/my/selling")
            .await?;
        tokio::time::sleep(client.random_delay()).await;
        let max = if args.all { args.max } else { 1 };
        let filter = args.id.clone().unwrap_or_default();
        let script = format!(
            r#"(() => {{
  const buttons = Array.from(document.querySelectorAll("button, a"))
    .filter(el => (el.innerText || "").includes("擦亮"));
  let clicked = 0;
  for (const btn of buttons) {{
    const card = btn.closest("[data-item-id]");
    const itemId = card?.getAttribute("data-item-id") || "";
    if ("{filter}" && itemId !== "{filter}") continue;
    btn.click();
    clicked += 1;
    if (clicked >= {max}) break;
  }}
  return clicked;
}})();"#
        );
        let clicked = client
            .execute_script(&page_id, &script)
            .await?
            .as_i64()
            .unwrap_or(0);
        Ok::<_, anyhow::Error>(json!({
            "action": "polish",
            "requested": max,
            "clicked": clicked,
        }))
    }
    .await;
    client.close_page(&page_id).await;
    result
}

async fn cmd_listing_action(
    config: &AppConfig,
    action: &str,
    id: &str,
    extra: serde_json::Value,
) -> Result<serde_json::Value> {
    let (client, page_id) = gateway_page(config).await?;
    let result = async {
        client
            .navigate(&page_id, &format!("https://www.goofish.com/item?id={id}"))
            .await?;
        tokio::time::sleep(client.random_delay()).await;
        Ok::<_, anyhow::Error>(json!({
            "action": action,
            "product_id": id,
            "detail": extra,
        }))
    }
    .await;
    client.close_page(&page_id).await;
    result
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = dotenv::dotenv();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = run(&cli).await;
    match result {
        Ok(value) => json_out(&value),
        Err(e) => {
            json_out(&json!({"error": e.to_string()}));
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> Result<serde_json::Value> {
    let config = AppConfig::load(cli.config.as_deref()).map_err(|e| anyhow::anyhow!("{e}"))?;

    match &cli.command {
        Command::Messages(args) => cmd_messages(&config, args).await,
        Command::Quote(args) => cmd_quote(&config, args).await,
        Command::Module(args) => cmd_module(&config, args).await,
        Command::Compliance(args) => cmd_compliance(&config, args).await,
        Command::Analytics(args) => cmd_analytics(&config, args).await,
        Command::Accounts(args) => cmd_accounts(&config, args).await,
        Command::Doctor(args) => {
            let report = doctor::run_doctor(&config, args.skip_gateway, args.skip_quote).await;
            Ok(serde_json::to_value(report)?)
        }
        Command::Publish(args) => cmd_publish(&config, args).await,
        Command::Polish(args) => cmd_polish(&config, args).await,
        Command::Price(args) => {
            cmd_listing_action(&config, "price", &args.id, json!({"price": args.price})).await
        }
        Command::Delist(args) => {
            cmd_listing_action(&config, "delist", &args.id, json!({})).await
        }
        Command::Relist(args) => {
            cmd_listing_action(&config, "relist", &args.id, json!({})).await
        }
    }
}
