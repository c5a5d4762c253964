//! Goofish IM WebSocket transport.
//!
//! - Single persistent connection; `/reg` registration with a signed token
//! - Heartbeat `/!` with ack-deadline reconnect
//! - Inbound sync frames acked before dispatch, decoded, deduped, and
//!   pushed into a bounded queue (overflow drops oldest)
//! - Outbound sends require a peer id learned from inbound traffic
//!
//! All socket writes go through one mutex-guarded sink; the reader task
//! never writes around it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::WsConfig;
use crate::errors::AppError;
use crate::transport::wire::{
    self, decode_sync_payload, event_fingerprint, extract_chat_event, generate_device_id,
    generate_mid, generate_sign, generate_uuid, parse_cookie_header, ChatEvent, APP_KEY,
    IM_APP_KEY,
};
use crate::transport::{ChatTransport, InboundSession};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";
const WS_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 DingTalk(2.1.5)";
const TOKEN_URL: &str =
    "https://h5api.m.goofish.com/h5/mtop.taobao.idlemessage.pc.login.token/1.0/";
const READY_WAIT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct TokenState {
    token: String,
    fetched_at: Option<Instant>,
}

pub struct GoofishWsTransport {
    config: WsConfig,
    cookie_text: String,
    my_user_id: String,
    device_id: String,
    http: reqwest::Client,

    token: AsyncMutex<TokenState>,
    sink: Arc<AsyncMutex<Option<WsSink>>>,

    queue: Mutex<VecDeque<InboundSession>>,
    queue_notify: Notify,
    session_peer: Mutex<HashMap<String, String>>,
    seen_events: Mutex<HashMap<String, Instant>>,

    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    stopped: AtomicBool,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl GoofishWsTransport {
    pub fn new(cookie_text: &str, config: WsConfig) -> Result<Arc<Self>, AppError> {
        let cookie_text = cookie_text.trim().to_string();
        let cookies = parse_cookie_header(&cookie_text);
        let my_user_id = cookies.get("unb").cloned().unwrap_or_default();
        if cookie_text.is_empty() || my_user_id.is_empty() {
            return Err(AppError::browser(
                "Invalid XIANYU_COOKIE_1. Missing cookie text or `unb`.",
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(12))
            .build()
            .map_err(|e| AppError::browser(format!("http client init failed: {e}")))?;

        let device_id = generate_device_id(&my_user_id);
        let (ready_tx, ready_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            cookie_text,
            my_user_id,
            device_id,
            http,
            token: AsyncMutex::new(TokenState {
                token: String::new(),
                fetched_at: None,
            }),
            sink: Arc::new(AsyncMutex::new(None)),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            session_peer: Mutex::new(HashMap::new()),
            seen_events: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx,
            stopped: AtomicBool::new(false),
            run_task: Mutex::new(None),
        }))
    }

    pub fn my_user_id(&self) -> &str {
        &self.my_user_id
    }

    pub fn known_peer(&self, session_id: &str) -> Option<String> {
        self.session_peer.lock().get(session_id).cloned()
    }

    async fn fetch_token(&self) -> Result<String> {
        {
            let state = self.token.lock().await;
            if let Some(fetched_at) = state.fetched_at {
                if !state.token.is_empty()
                    && fetched_at.elapsed().as_secs() < self.config.token_refresh_interval_seconds
                {
                    return Ok(state.token.clone());
                }
            }
        }

        let cookies = parse_cookie_header(&self.cookie_text);
        let token_seed = cookies
            .get("_m_h5_tk")
            .and_then(|v| v.split('_').next())
            .unwrap_or("")
            .trim()
            .to_string();
        if token_seed.is_empty() {
            return Err(anyhow!("cookie missing `_m_h5_tk`"));
        }

        let t = wire::now_ms().to_string();
        let data_val = serde_json::to_string(&json!({
            "appKey": IM_APP_KEY,
            "deviceId": self.device_id,
        }))
        .context("serialize token payload")?;
        let sign = generate_sign(&t, &token_seed, &data_val, APP_KEY);

        let response = self
            .http
            .post(TOKEN_URL)
            .query(&[
                ("jsv", "2.7.2"),
                ("appKey", APP_KEY),
                ("t", t.as_str()),
                ("sign", sign.as_str()),
                ("v", "1.0"),
                ("type", "originaljson"),
                ("accountSite", "xianyu"),
                ("dataType", "json"),
                ("timeout", "20000"),
                ("api", "mtop.taobao.idlemessage.pc.login.token"),
                ("sessionOption", "AutoLoginOnly"),
                ("spm_cnt", "a21ybx.im.0.0"),
            ])
            .header("cookie", &self.cookie_text)
            .header("origin", "https://www.goofish.com")
            .header("referer", "https://www.goofish.com/")
            .header("user-agent", USER_AGENT)
            .form(&[("data", data_val.as_str())])
            .send()
            .await
            .context("token request failed")?;

        let payload: serde_json::Value = response.json().await.context("token response body")?;
        let ret_ok = payload
            .get("ret")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .any(|item| item.as_str().unwrap_or("").contains("SUCCESS::调用成功"))
            })
            .unwrap_or(false);
        if !ret_ok {
            return Err(anyhow!("token API failed: {}", payload["ret"]));
        }

        let token = payload
            .pointer("/data/accessToken")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(anyhow!("token API success but accessToken missing"));
        }

        let mut state = self.token.lock().await;
        state.token = token.clone();
        state.fetched_at = Some(Instant::now());
        Ok(token)
    }

    async fn send_frame(&self, frame: &serde_json::Value) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or_else(|| anyhow!("socket not connected"))?;
        sink.send(Message::Text(frame.to_string()))
            .await
            .context("ws send")?;
        Ok(())
    }

    async fn send_reg(&self) -> Result<()> {
        let token = self.fetch_token().await?;
        let reg = json!({
            "lwp": "/reg",
            "headers": {
                "cache-header": "app-key token ua wv",
                "app-key": IM_APP_KEY,
                "token": token,
                "ua": WS_USER_AGENT,
                "dt": "j",
                "wv": "im:3,au:3,sy:6",
                "sync": "0,0;0;0;",
                "did": self.device_id,
                "mid": generate_mid(),
            },
        });
        self.send_frame(&reg).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let now = wire::now_ms();
        let ack_diff = json!({
            "lwp": "/r/SyncStatus/ackDiff",
            "headers": {"mid": generate_mid()},
            "body": [{
                "pipeline": "sync",
                "tooLong2Tag": "PNM,1",
                "channel": "sync",
                "topic": "sync",
                "highPts": 0,
                "pts": now * 1000,
                "seq": 0,
                "timestamp": now,
            }],
        });
        self.send_frame(&ack_diff).await
    }

    async fn send_heartbeat(&self) -> Result<()> {
        self.send_frame(&json!({"lwp": "/!", "headers": {"mid": generate_mid()}}))
            .await
    }

    /// Echo `{code:200, headers:{mid,...}}` for any frame carrying a mid.
    async fn ack_packet(&self, packet: &serde_json::Value) {
        let Some(headers) = packet.get("headers").and_then(|v| v.as_object()) else {
            return;
        };
        let Some(mid) = headers.get("mid") else {
            return;
        };
        let mut ack_headers = serde_json::Map::new();
        ack_headers.insert("mid".into(), mid.clone());
        ack_headers.insert(
            "sid".into(),
            headers.get("sid").cloned().unwrap_or_else(|| "".into()),
        );
        for key in ["app-key", "ua", "dt"] {
            if let Some(value) = headers.get(key) {
                ack_headers.insert(key.into(), value.clone());
            }
        }
        let ack = json!({"code": 200, "headers": ack_headers});
        if let Err(e) = self.send_frame(&ack).await {
            debug!(error = %e, "ack send failed");
        }
    }

    fn cleanup_seen(&self) {
        let expire = Duration::from_millis(self.config.message_expire_ms.max(60_000) * 2);
        let now = Instant::now();
        self.seen_events
            .lock()
            .retain(|_, seen_at| now.duration_since(*seen_at) <= expire);
    }

    fn push_event(&self, event: ChatEvent) {
        if event.sender_user_id == self.my_user_id {
            return;
        }
        let age_ms = wire::now_ms() - event.create_time;
        if age_ms > self.config.message_expire_ms as i64 {
            return;
        }

        let fingerprint = event_fingerprint(&event.chat_id, event.create_time, &event.text);
        {
            let mut seen = self.seen_events.lock();
            if seen.contains_key(&fingerprint) {
                return;
            }
            seen.insert(fingerprint, Instant::now());
        }
        self.cleanup_seen();

        self.session_peer
            .lock()
            .insert(event.chat_id.clone(), event.sender_user_id.clone());

        let session = InboundSession {
            session_id: event.chat_id,
            peer_name: event.sender_name,
            item_title: event.item_id,
            last_message: event.text,
            unread_count: 1,
            sender_user_id: event.sender_user_id,
            create_time: event.create_time,
            source: "ws".into(),
        };

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.max_queue_size.max(10) {
                queue.pop_front();
            }
            queue.push_back(session);
        }
        self.queue_notify.notify_waiters();
    }

    fn handle_sync(&self, packet: &serde_json::Value) {
        let Some(items) = packet
            .pointer("/body/syncPushPackage/data")
            .and_then(|v| v.as_array())
        else {
            return;
        };
        for item in items {
            let Some(raw) = item.get("data").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(decoded) = decode_sync_payload(raw) else {
                continue;
            };
            if let Some(event) = extract_chat_event(&decoded) {
                self.push_event(event);
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let mut request = self
            .config
            .base_url
            .as_str()
            .into_client_request()
            .context("build ws request")?;
        let headers = request.headers_mut();
        headers.insert("Cookie", HeaderValue::from_str(&self.cookie_text)?);
        headers.insert("Origin", HeaderValue::from_static("https://www.goofish.com"));
        headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));

        let (stream, _response) = connect_async(request).await.context("ws connect")?;
        let (sink, mut source): (WsSink, WsSource) = stream.split();
        *self.sink.lock().await = Some(sink);

        self.send_reg().await?;
        let _ = self.ready_tx.send(true);
        info!("connected to Goofish WebSocket transport");

        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_seconds.max(1));
        let ack_deadline = heartbeat_interval
            + Duration::from_secs(self.config.heartbeat_timeout_seconds);
        let mut last_heartbeat_sent = Instant::now() - heartbeat_interval;
        let mut last_ack = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.stopped.load(Ordering::Relaxed) {
                return Ok(());
            }
            tokio::select! {
                _ = tick.tick() => {
                    if last_heartbeat_sent.elapsed() >= heartbeat_interval {
                        self.send_heartbeat().await?;
                        last_heartbeat_sent = Instant::now();
                    }
                    if last_ack.elapsed() > ack_deadline {
                        return Err(anyhow!("websocket heartbeat timeout"));
                    }
                }
                msg = source.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow!("websocket stream ended"));
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            let Ok(packet) = serde_json::from_str::<serde_json::Value>(&text) else {
                                continue;
                            };
                            if packet.get("code").and_then(|v| v.as_i64()) == Some(200) {
                                last_ack = Instant::now();
                            }
                            // Ack before dispatching for processing.
                            self.ack_packet(&packet).await;
                            self.handle_sync(&packet);
                        }
                        Ok(Message::Ping(payload)) => {
                            let mut sink = self.sink.lock().await;
                            if let Some(sink) = sink.as_mut() {
                                let _ = sink.send(Message::Pong(payload)).await;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "websocket close frame");
                            return Err(anyhow!("websocket closed by peer"));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("websocket error: {e}")),
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut delay = Duration::from_secs_f64(self.config.reconnect_delay_seconds.max(0.5));
        let max_delay = Duration::from_secs_f64(self.config.max_backoff_seconds.max(1.0));

        while !self.stopped.load(Ordering::Relaxed) {
            match self.connect_and_stream().await {
                Ok(()) => break,
                Err(e) => {
                    let _ = self.ready_tx.send(false);
                    *self.sink.lock().await = None;
                    if self.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!(error = %e, "Goofish WebSocket disconnected, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
        let _ = self.ready_tx.send(false);
        *self.sink.lock().await = None;
    }

    async fn wait_ready(&self) -> bool {
        if *self.ready_rx.borrow() {
            return true;
        }
        let mut rx = self.ready_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(READY_WAIT, wait).await.is_ok() && *self.ready_rx.borrow()
    }

    /// Spawn the reader/heartbeat task once; later calls are no-ops while
    /// it is alive.
    pub fn spawn_run(this: &Arc<Self>) {
        let mut task = this.run_task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        this.stopped.store(false, Ordering::Relaxed);
        let transport = Arc::clone(this);
        *task = Some(tokio::spawn(transport.run()));
    }
}

#[async_trait::async_trait]
impl ChatTransport for Arc<GoofishWsTransport> {
    async fn start(&self) {
        GoofishWsTransport::spawn_run(self);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        let _ = self.ready_tx.send(false);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        let handle = self.run_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    async fn get_unread_sessions(&self, limit: usize) -> Vec<InboundSession> {
        GoofishWsTransport::spawn_run(self);
        if !self.wait_ready().await {
            return Vec::new();
        }

        if self.queue.lock().is_empty() {
            let wait = Duration::from_secs_f64(self.config.queue_wait_seconds.max(0.05));
            let _ = tokio::time::timeout(wait, self.queue_notify.notified()).await;
        }

        let limit = limit.max(1);
        let mut out: Vec<InboundSession> = Vec::new();
        let mut queue = self.queue.lock();
        while out.len() < limit {
            let Some(item) = queue.pop_front() else {
                break;
            };
            if item.session_id.is_empty()
                || out.iter().any(|s| s.session_id == item.session_id)
            {
                continue;
            }
            out.push(item);
        }
        out
    }

    async fn send_text(&self, session_id: &str, text: &str) -> bool {
        GoofishWsTransport::spawn_run(self);
        if !self.wait_ready().await {
            return false;
        }

        let chat_id = session_id.trim();
        let Some(to_user_id) = self.known_peer(chat_id).filter(|p| !p.is_empty()) else {
            warn!(session_id = chat_id, "ws send skipped: missing peer mapping");
            return false;
        };

        let payload = json!({"contentType": 1, "text": {"text": text}});
        let content_b64 = STANDARD.encode(payload.to_string().as_bytes());
        let frame = json!({
            "lwp": "/r/MessageSend/sendByReceiverScope",
            "headers": {"mid": generate_mid()},
            "body": [
                {
                    "uuid": generate_uuid(),
                    "cid": format!("{chat_id}@goofish"),
                    "conversationType": 1,
                    "content": {"contentType": 101, "custom": {"type": 1, "data": content_b64}},
                    "redPointPolicy": 0,
                    "extension": {"extJson": "{}"},
                    "ctx": {"appVersion": "1.0", "platform": "web"},
                    "mtags": {},
                    "msgReadStatusSetting": 1,
                },
                {"actualReceivers": [
                    format!("{to_user_id}@goofish"),
                    format!("{}@goofish", self.my_user_id),
                ]},
            ],
        });

        match self.send_frame(&frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "ws send failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Arc<GoofishWsTransport> {
        GoofishWsTransport::new("unb=1000; _m_h5_tk=seed_169", WsConfig::default()).unwrap()
    }

    fn event(chat_id: &str, sender: &str, text: &str, create_time: i64) -> ChatEvent {
        ChatEvent {
            chat_id: chat_id.into(),
            sender_user_id: sender.into(),
            sender_name: "买家".into(),
            text: text.into(),
            item_id: String::new(),
            create_time,
        }
    }

    #[test]
    fn rejects_cookie_without_unb() {
        let result = GoofishWsTransport::new("_m_h5_tk=seed_169", WsConfig::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn self_sent_events_are_dropped() {
        let t = transport();
        t.push_event(event("c1", "1000", "hello", wire::now_ms()));
        assert!(t.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn expired_events_are_dropped() {
        let t = transport();
        let stale = wire::now_ms() - (t.config.message_expire_ms as i64 + 1000);
        t.push_event(event("c1", "2000", "hello", stale));
        assert!(t.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_events_are_deduped_and_peer_learned() {
        let t = transport();
        let now = wire::now_ms();
        t.push_event(event("c1", "2000", "hello", now));
        t.push_event(event("c1", "2000", "hello", now));
        assert_eq!(t.queue.lock().len(), 1);
        assert_eq!(t.known_peer("c1").as_deref(), Some("2000"));
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest() {
        let mut config = WsConfig::default();
        config.max_queue_size = 10;
        let t = GoofishWsTransport::new("unb=1000; _m_h5_tk=seed_169", config).unwrap();
        let now = wire::now_ms();
        for i in 0..15 {
            t.push_event(event(&format!("c{i}"), "2000", "hello", now + i));
        }
        let queue = t.queue.lock();
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.front().unwrap().session_id, "c5");
    }

    #[tokio::test]
    async fn send_text_without_peer_mapping_fails() {
        let t = transport();
        // Mark ready without a socket; the peer check fires first.
        let _ = t.ready_tx.send(true);
        assert!(!t.send_text("unknown_session", "hi").await);
    }
}
