//! Browser gateway HTTP client.
//!
//! Drives a remote browser profile through the gateway's control API:
//! `/start`, `/tabs/open`, `/tabs/focus`, `/tabs/{id}`, `/navigate`, `/act`
//! (click / type / script), `/screenshot`, `/cookies`. The DOM chat
//! transport and the listing-flow commands both ride on this client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::errors::AppError;

pub struct BrowserClient {
    base_url: String,
    profile: String,
    token: String,
    http: reqwest::Client,
    connected: AtomicBool,
    delay_range: (f64, f64),
}

impl BrowserClient {
    pub fn new(config: &BrowserConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(5)))
            .build()
            .map_err(|e| AppError::browser(format!("http client init failed: {e}")))?;
        Ok(Self {
            base_url: config.base_url(),
            profile: config.profile.clone(),
            token: config.token.clone(),
            http,
            connected: AtomicBool::new(false),
            delay_range: (config.delay_min_seconds, config.delay_max_seconds),
        })
    }

    pub fn random_delay(&self) -> Duration {
        let (min, max) = self.delay_range;
        let max = max.max(min);
        Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .query(&[("profile", self.profile.as_str())]);
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    pub async fn connect(&self) -> Result<(), AppError> {
        info!(gateway = %self.base_url, profile = %self.profile, "connecting to browser gateway");
        if self.probe().await.is_ok() {
            self.connected.store(true, Ordering::Relaxed);
            return Ok(());
        }

        // Profile may simply not be running yet.
        let started = self
            .request(reqwest::Method::POST, "/start")
            .send()
            .await
            .map_err(|e| AppError::browser(format!("gateway unreachable: {e}")))?;
        if !started.status().is_success() {
            return Err(AppError::browser(format!(
                "gateway /start returned {}",
                started.status()
            )));
        }
        self.probe()
            .await
            .map_err(|e| AppError::browser(format!("gateway not ready after /start: {e}")))?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn probe(&self) -> anyhow::Result<()> {
        let response = self
            .request(reqwest::Method::GET, "/")
            .send()
            .await
            .context("gateway probe")?;
        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!("gateway probe returned {}", response.status())
        }
    }

    pub async fn new_page(&self) -> Result<String, AppError> {
        let response = self
            .request(reqwest::Method::POST, "/tabs/open")
            .send()
            .await
            .map_err(|e| AppError::browser(format!("tabs/open failed: {e}")))?;
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::browser(format!("tabs/open body: {e}")))?;
        let page_id = payload
            .get("targetId")
            .or_else(|| payload.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if page_id.is_empty() {
            return Err(AppError::browser("tabs/open returned no target id"));
        }
        debug!(page_id = %page_id, "opened browser tab");
        Ok(page_id)
    }

    pub async fn close_page(&self, page_id: &str) -> bool {
        self.request(reqwest::Method::DELETE, &format!("/tabs/{page_id}"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn focus_page(&self, page_id: &str) -> bool {
        self.request(reqwest::Method::POST, "/tabs/focus")
            .query(&[("targetId", page_id)])
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn navigate(&self, page_id: &str, url: &str) -> Result<(), AppError> {
        let response = self
            .request(reqwest::Method::POST, "/navigate")
            .json(&json!({"targetId": page_id, "url": url}))
            .send()
            .await
            .map_err(|e| AppError::browser(format!("navigate failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::browser(format!(
                "navigate returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn act(&self, body: serde_json::Value) -> Result<serde_json::Value, AppError> {
        let response = self
            .request(reqwest::Method::POST, "/act")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::browser(format!("act failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::browser(format!(
                "act returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::browser(format!("act body: {e}")))
    }

    pub async fn click(&self, page_id: &str, selector: &str) -> bool {
        self.act(json!({
            "targetId": page_id,
            "action": "click",
            "selector": selector,
        }))
        .await
        .is_ok()
    }

    pub async fn type_text(&self, page_id: &str, selector: &str, text: &str) -> bool {
        self.act(json!({
            "targetId": page_id,
            "action": "type",
            "selector": selector,
            "text": text,
        }))
        .await
        .is_ok()
    }

    /// Evaluate a script in the page; returns the gateway's `result` field.
    pub async fn execute_script(
        &self,
        page_id: &str,
        script: &str,
    ) -> Result<serde_json::Value, AppError> {
        let payload = self
            .act(json!({
                "targetId": page_id,
                "action": "script",
                "script": script,
            }))
            .await?;
        Ok(payload.get("result").cloned().unwrap_or(payload))
    }

    pub async fn screenshot(&self, page_id: &str) -> Result<Vec<u8>, AppError> {
        let response = self
            .request(reqwest::Method::GET, "/screenshot")
            .query(&[("targetId", page_id)])
            .send()
            .await
            .map_err(|e| AppError::browser(format!("screenshot failed: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::browser(format!("screenshot body: {e}")))?;
        Ok(bytes.to_vec())
    }

    pub async fn set_cookies(&self, cookie_header: &str, domain: &str) -> Result<(), AppError> {
        let cookies: Vec<serde_json::Value> = cookie_header
            .split(';')
            .filter_map(|part| {
                let (name, value) = part.trim().split_once('=')?;
                Some(json!({
                    "name": name.trim(),
                    "value": value.trim(),
                    "domain": domain,
                    "path": "/",
                }))
            })
            .collect();
        if cookies.is_empty() {
            return Ok(());
        }
        let response = self
            .request(reqwest::Method::POST, "/cookies/set")
            .json(&json!({"cookies": cookies}))
            .send()
            .await
            .map_err(|e| AppError::browser(format!("cookies/set failed: {e}")))?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "cookies/set rejected");
        }
        Ok(())
    }
}
