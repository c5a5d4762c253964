//! Dual-mode chat transport: WebSocket push with DOM fallback.

pub mod dom;
pub mod msgpack;
pub mod wire;
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One unread chat surfaced by a transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundSession {
    pub session_id: String,
    #[serde(default)]
    pub peer_name: String,
    #[serde(default)]
    pub item_title: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub sender_user_id: String,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub source: String,
}

/// Shared contract for the WebSocket and DOM channels.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    fn is_ready(&self) -> bool;
    /// Drain up to `limit` distinct unread sessions, waiting briefly when
    /// the inbound queue is empty.
    async fn get_unread_sessions(&self, limit: usize) -> Vec<InboundSession>;
    async fn send_text(&self, session_id: &str, text: &str) -> bool;
}

pub use wire::ChatEvent;
pub use ws::GoofishWsTransport;
