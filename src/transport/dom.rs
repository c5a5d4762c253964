//! DOM chat transport: reads the session list page and sends replies through
//! scripted selectors on the browser gateway. Fallback path for when the
//! WebSocket channel is not ready.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::browser::BrowserClient;
use crate::transport::{ChatTransport, InboundSession};

const MESSAGE_PAGE: &str = "https://www.goofish.com/im";

pub struct DomTransport {
    client: Arc<BrowserClient>,
}

impl DomTransport {
    pub fn new(client: Arc<BrowserClient>) -> Self {
        Self { client }
    }

    fn session_list_script(limit: usize) -> String {
        format!(
            r#"(() => {{
  const nodes = Array.from(
    document.querySelectorAll("[data-session-id], [class*='session'], [class*='conversation'], li")
  );
  const result = [];
  for (const node of nodes) {{
    const text = (node.innerText || "").trim();
    if (!text) continue;
    const unreadEl = node.querySelector("[class*='unread'], [class*='badge'], [class*='count']");
    const unreadText = (unreadEl?.innerText || "").trim();
    const unreadCount = Number((unreadText.match(/\d+/) || ["0"])[0]);
    if (unreadCount <= 0) continue;
    const lines = text.split("\n").map(s => s.trim()).filter(Boolean);
    const sessionId = node.getAttribute("data-session-id")
      || node.dataset?.sessionId
      || node.getAttribute("data-id")
      || `session_${{result.length + 1}}`;
    result.push({{
      session_id: sessionId,
      peer_name: lines[0] || "买家",
      item_title: lines.length > 2 ? lines[1] : "",
      last_message: lines[lines.length - 1] || "",
      unread_count: unreadCount,
    }});
    if (result.length >= {limit}) break;
  }}
  return result;
}})();"#
        )
    }

    fn send_reply_script(session_id: &str, reply_text: &str) -> String {
        let escaped = reply_text.replace('\\', "\\\\").replace('`', "\\`");
        let session = session_id.replace('"', "");
        format!(
            r#"(() => {{
  const target = document.querySelector(`[data-session-id="{session}"]`)
    || document.querySelector(`[data-id="{session}"]`);
  if (target) target.click();
  const input = document.querySelector("textarea")
    || document.querySelector("[contenteditable='true']")
    || document.querySelector("input[placeholder*='消息']");
  if (!input) return false;
  if (input.tagName.toLowerCase() === "textarea" || input.tagName.toLowerCase() === "input") {{
    input.value = `{escaped}`;
    input.dispatchEvent(new Event("input", {{ bubbles: true }}));
  }} else {{
    input.innerText = `{escaped}`;
    input.dispatchEvent(new InputEvent("input", {{ bubbles: true, data: `{escaped}` }}));
  }}
  const sendBtn = Array.from(document.querySelectorAll("button,span,a")).find(el =>
    (el.innerText || "").includes("发送") || (el.innerText || "").toLowerCase().includes("send")
  );
  if (sendBtn) {{
    sendBtn.click();
    return true;
  }}
  const keyboardEvent = new KeyboardEvent("keydown", {{ key: "Enter", code: "Enter", bubbles: true }});
  input.dispatchEvent(keyboardEvent);
  return true;
}})();"#
        )
    }
}

#[async_trait]
impl ChatTransport for DomTransport {
    async fn start(&self) {
        if !self.client.is_connected() {
            if let Err(e) = self.client.connect().await {
                warn!(error = %e, "browser gateway connect failed");
            }
        }
    }

    async fn stop(&self) {
        self.client.disconnect().await;
    }

    fn is_ready(&self) -> bool {
        self.client.is_connected()
    }

    async fn get_unread_sessions(&self, limit: usize) -> Vec<InboundSession> {
        self.start().await;
        if !self.client.is_connected() {
            return Vec::new();
        }

        let page_id = match self.client.new_page().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "dom transport could not open a page");
                return Vec::new();
            }
        };

        let sessions = async {
            self.client.navigate(&page_id, MESSAGE_PAGE).await?;
            tokio::time::sleep(self.client.random_delay()).await;
            let raw = self
                .client
                .execute_script(&page_id, &Self::session_list_script(limit.max(1)))
                .await?;
            let mut sessions: Vec<InboundSession> =
                serde_json::from_value(raw).unwrap_or_default();
            for session in &mut sessions {
                session.source = "dom".into();
            }
            Ok::<_, crate::errors::AppError>(sessions)
        }
        .await;

        self.client.close_page(&page_id).await;
        match sessions {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!(error = %e, "dom session scrape failed");
                Vec::new()
            }
        }
    }

    async fn send_text(&self, session_id: &str, text: &str) -> bool {
        self.start().await;
        if !self.client.is_connected() {
            return false;
        }

        let Ok(page_id) = self.client.new_page().await else {
            return false;
        };

        let sent = async {
            self.client.navigate(&page_id, MESSAGE_PAGE).await.ok()?;
            tokio::time::sleep(self.client.random_delay()).await;
            let result = self
                .client
                .execute_script(&page_id, &Self::send_reply_script(session_id, text))
                .await
                .ok()?;
            Some(result.as_bool().unwrap_or(false))
        }
        .await
        .unwrap_or(false);

        self.client.close_page(&page_id).await;
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_list_script_embeds_limit() {
        let script = DomTransport::session_list_script(7);
        assert!(script.contains("result.length >= 7"));
        assert!(script.contains("data-session-id"));
    }

    #[test]
    fn send_reply_script_escapes_backticks() {
        let script = DomTransport::send_reply_script("s1", "价格是 `12` 元");
        assert!(script.contains("\\`12\\`"));
        assert!(!script.contains("`12`"));
    }
}
