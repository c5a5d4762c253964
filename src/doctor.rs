//! Environment doctor: structured readiness report for the CLI.
//!
//! Warning-only failures do not flip `ready`; only required checks do.

use serde::Serialize;
use serde_json::json;

use crate::config::{AppConfig, QuoteMode, RuntimeMode, TransportMode};
use crate::transport::wire::parse_cookie_header;

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub passed: bool,
    pub required: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub ready: bool,
    pub summary: String,
    pub checks: Vec<DoctorCheck>,
    pub next_steps: Vec<String>,
}

/// Structural cookie validation shared with `accounts --action health`.
pub fn cookie_health(cookie: &str) -> serde_json::Value {
    let cookies = parse_cookie_header(cookie);
    let has_unb = cookies.get("unb").map(|v| !v.is_empty()).unwrap_or(false);
    let has_token_seed = cookies
        .get("_m_h5_tk")
        .map(|v| v.contains('_') && !v.starts_with('_'))
        .unwrap_or(false);
    json!({
        "present": !cookie.trim().is_empty(),
        "pair_count": cookies.len(),
        "has_unb": has_unb,
        "has_token_seed": has_token_seed,
        "healthy": has_unb && has_token_seed,
    })
}

fn check(name: &str, passed: bool, required: bool, detail: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        name: name.into(),
        passed,
        required,
        detail: detail.into(),
    }
}

pub async fn run_doctor(config: &AppConfig, skip_gateway: bool, skip_quote: bool) -> DoctorReport {
    let mut checks = Vec::new();
    let mut next_steps = Vec::new();

    // Cookie shape.
    let cookie = config.messages.resolve_cookie();
    let health = cookie_health(&cookie);
    let cookie_ok = health["healthy"].as_bool().unwrap_or(false);
    let cookie_required = config.messages.transport != TransportMode::Dom;
    checks.push(check(
        "session_cookie",
        cookie_ok,
        cookie_required,
        format!(
            "present={} unb={} token_seed={}",
            health["present"], health["has_unb"], health["has_token_seed"]
        ),
    ));
    if !cookie_ok {
        next_steps.push(
            "Set XIANYU_COOKIE_1 with a logged-in cookie containing `unb` and `_m_h5_tk`."
                .to_string(),
        );
    }

    // Data dir writable.
    let data_dir = std::path::Path::new(&config.data_dir.0);
    let dir_ok = std::fs::create_dir_all(data_dir)
        .and_then(|_| {
            let probe = data_dir.join(".doctor_probe");
            std::fs::write(&probe, b"ok")?;
            std::fs::remove_file(&probe)
        })
        .is_ok();
    checks.push(check(
        "data_dir_writable",
        dir_ok,
        true,
        data_dir.display().to_string(),
    ));
    if !dir_ok {
        next_steps.push(format!("Make {} writable.", data_dir.display()));
    }

    // Store files open and migrate.
    let workflow_ok = crate::workflow::WorkflowStore::open(&config.messages.workflow.db_path).is_ok();
    checks.push(check(
        "workflow_db",
        workflow_ok,
        true,
        config.messages.workflow.db_path.clone(),
    ));
    let compliance_ok = crate::compliance::ComplianceCenter::open(
        &config.compliance.policy_path,
        &config.compliance.db_path,
    )
    .is_ok();
    checks.push(check(
        "compliance_db",
        compliance_ok,
        true,
        config.compliance.db_path.clone(),
    ));
    let snapshots_ok =
        crate::quote::snapshot::QuoteSnapshotStore::open(&config.quote.snapshot_db_path).is_ok();
    checks.push(check(
        "quote_snapshot_db",
        snapshots_ok,
        true,
        config.quote.snapshot_db_path.clone(),
    ));

    // Policy file parses when present.
    let policy_path = std::path::Path::new(&config.compliance.policy_path);
    let policy_ok = if policy_path.exists() {
        std::fs::read_to_string(policy_path)
            .ok()
            .and_then(|raw| serde_yaml::from_str::<crate::compliance::PolicyFile>(&raw).ok())
            .is_some()
    } else {
        true
    };
    checks.push(check(
        "compliance_policy_file",
        policy_ok,
        false,
        if policy_path.exists() {
            policy_path.display().to_string()
        } else {
            "absent (builtin defaults apply)".to_string()
        },
    ));

    // Quote source readiness.
    if !skip_quote {
        let repo = crate::quote::CostTableRepository::new(&config.quote.cost_table_dir);
        let records = repo.record_count();
        let remote_ready = config.quote.remote.enabled;
        let needs_source = config.quote.mode == QuoteMode::Hybrid;
        let passed = !needs_source || records > 0 || remote_ready;
        checks.push(check(
            "quote_source",
            passed,
            false,
            format!(
                "mode={:?} cost_records={records} remote_enabled={remote_ready}",
                config.quote.mode
            ),
        ));
        if records == 0 {
            next_steps.push(format!(
                "Drop courier cost CSVs into {} for table-backed quotes.",
                config.quote.cost_table_dir
            ));
        }
    }

    // Browser gateway (DOM transport / listing flows).
    if !skip_gateway {
        let required =
            config.runtime == RuntimeMode::Pro || config.messages.transport == TransportMode::Dom;
        let reachable = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .ok();
        let gateway_ok = match reachable {
            Some(client) => client
                .get(config.browser.base_url())
                .send()
                .await
                .map(|r| r.status().is_success() || r.status().is_client_error())
                .unwrap_or(false),
            None => false,
        };
        checks.push(check(
            "browser_gateway",
            gateway_ok,
            required,
            config.browser.base_url(),
        ));
        if !gateway_ok && required {
            next_steps.push(format!(
                "Start the browser gateway at {} or switch messages.transport to `ws`.",
                config.browser.base_url()
            ));
        }
    }

    // Runtime mode resolves.
    checks.push(check(
        "runtime_mode",
        true,
        false,
        config.runtime.as_str().to_string(),
    ));

    let failed_required: Vec<&DoctorCheck> =
        checks.iter().filter(|c| c.required && !c.passed).collect();
    let ready = failed_required.is_empty();
    let summary = format!(
        "{}/{} checks passed, {} required failures",
        checks.iter().filter(|c| c.passed).count(),
        checks.len(),
        failed_required.len()
    );

    DoctorReport {
        ready,
        summary,
        checks,
        next_steps,
    }
}
