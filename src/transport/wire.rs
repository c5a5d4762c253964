//! Wire-level helpers for the chat channel: cookie parsing, request
//! signing, id generation, sync-payload decoding, and chat-event extraction.

use std::collections::HashMap;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use lazy_static::lazy_static;
use md5::{Digest as _, Md5};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::transport::msgpack::{Decoder, Value};

pub const APP_KEY: &str = "34839810";
pub const IM_APP_KEY: &str = "444e9908a51d1cb236a27862abc769c9";

pub fn parse_cookie_header(cookie_text: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for part in cookie_text.trim().split(';') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.is_empty() {
            result.insert(key.to_string(), value.trim().to_string());
        }
    }
    result
}

/// `md5(token & timestamp & app_key & data)` in lowercase hex.
pub fn generate_sign(timestamp_ms: &str, token: &str, data: &str, app_key: &str) -> String {
    let raw = format!("{token}&{timestamp_ms}&{app_key}&{data}");
    let mut hasher = Md5::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message id: 3 random digits + unix-ms, space, zero.
pub fn generate_mid() -> String {
    let prefix = rand::thread_rng().gen_range(100..1000);
    format!("{prefix}{} 0", now_ms())
}

pub fn generate_uuid() -> String {
    format!("-{}1", now_ms())
}

/// Device id: UUIDv4-shaped hex string suffixed with the user id, so
/// reconnects from the same account present a stable-looking device family.
pub fn generate_device_id(user_id: &str) -> String {
    const HEX: &[u8] = b"0123456789ABCDEF";
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(37 + user_id.len());
    for i in 0..36 {
        match i {
            8 | 13 | 18 | 23 => out.push('-'),
            14 => out.push('4'),
            19 => {
                let rv: u8 = rng.gen_range(0..16);
                out.push(HEX[((rv & 0x3) | 0x8) as usize] as char);
            }
            _ => out.push(HEX[rng.gen_range(0..16) as usize] as char),
        }
    }
    out.push('-');
    out.push_str(user_id);
    out
}

/// Decode a sync-frame payload: base64 (standard or URL-safe, padding
/// optional) wrapping either JSON or MessagePack.
pub fn decode_sync_payload(raw_text: &str) -> Option<Value> {
    let mut text: String = raw_text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_'))
        .collect();
    if text.is_empty() {
        return None;
    }
    while text.len() % 4 != 0 {
        text.push('=');
    }

    let buf = STANDARD
        .decode(text.as_bytes())
        .or_else(|_| URL_SAFE.decode(text.as_bytes()))
        .ok()?;

    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&buf) {
        return Some(Value::from_json(&json));
    }
    Decoder::new(&buf).decode().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub chat_id: String,
    pub sender_user_id: String,
    pub sender_name: String,
    pub text: String,
    pub item_id: String,
    pub create_time: i64,
}

lazy_static! {
    static ref ITEM_ID_RE: Regex = Regex::new(r"[?&]itemId=(\d+)").expect("item id regex");
}

/// Walk the decoded sync tree and pull out a chat event. The payload nests
/// maps keyed `"1"/"2"/"5"/"10"` as strings or integers; both are accepted.
pub fn extract_chat_event(message: &Value) -> Option<ChatEvent> {
    if !message.is_map() {
        return None;
    }
    let body = message.get("1").filter(|v| v.is_map())?;
    let content = body.get("10").filter(|v| v.is_map())?;

    let text = content
        .get_any(&["reminderContent", "content", "text"])
        .and_then(Value::to_text)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let sender_user_id = content
        .get_any(&["senderUserId", "fromUserId", "senderId"])
        .and_then(Value::to_text)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let sender_name = content
        .get_any(&["reminderTitle", "senderNick", "senderName"])
        .and_then(Value::to_text)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let chat_ref = body
        .get_any(&["2", "cid", "chatId"])
        .and_then(Value::to_text)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let chat_id = chat_ref
        .split_once('@')
        .map(|(head, _)| head.to_string())
        .unwrap_or(chat_ref);

    if text.is_empty() || sender_user_id.is_empty() || chat_id.is_empty() {
        return None;
    }

    let create_time = body
        .get_any(&["5", "createTime"])
        .and_then(Value::as_i64)
        .unwrap_or_else(now_ms);

    let reminder_url = content
        .get_any(&["reminderUrl", "url"])
        .and_then(Value::to_text)
        .unwrap_or_default();
    let item_id = ITEM_ID_RE
        .captures(&reminder_url)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    Some(ChatEvent {
        chat_id,
        sender_user_id,
        sender_name: if sender_name.is_empty() {
            "买家".to_string()
        } else {
            sender_name
        },
        text,
        item_id,
        create_time,
    })
}

/// 20-hex-char fingerprint used for inbound dedup.
pub fn event_fingerprint(chat_id: &str, create_time: i64, text: &str) -> String {
    use sha1::{Digest as _, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(format!("{chat_id}:{create_time}:{text}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..20].to_string()
}

pub fn sha1_hex(text: &str) -> String {
    use sha1::{Digest as _, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
