// Transport collaborator - the anonymizing relay as a black box
//
// Outbound telemetry leaves through `send` (fire-and-forget, best-effort
// acceptance). The quorum endpoints need request/response semantics and
// use `send_instant`. The relay itself is out of scope; the crate ships
// an HTTP implementation that maps actions to base URLs, plus a channel
// transport for tests.

use crate::config::Options;
use crate::digest::random32;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A message ready for the deduplicating sender.
///
/// `deduplicate_by` is the message-type-specific key (the URL for page
/// messages, the canonical token for request messages). `None` disables
/// deduplication for this message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub action: String,
    pub payload: Value,
    pub ver: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplicate_by: Option<String>,
}

impl OutboundMessage {
    /// Assemble the wire envelope:
    /// `{action, payload, ver, "anti-duplicates", ts, channel, platform?, userAgent?}`.
    pub fn envelope(&self, options: &Options, day: &str) -> Value {
        let mut body = json!({
            "action": self.action,
            "payload": self.payload,
            "ver": self.ver,
            "anti-duplicates": random32(),
            "ts": day,
            "channel": options.channel,
        });
        if let Some(platform) = &options.platform {
            body["platform"] = json!(platform);
        }
        if let Some(user_agent) = &options.user_agent {
            body["userAgent"] = json!(user_agent);
        }
        body
    }
}

/// Request for the request/response path (quorum endpoints).
#[derive(Debug, Clone)]
pub struct InstantRequest {
    /// Logical endpoint group, resolved to a base URL by the transport.
    pub action: String,
    /// Path plus query string, appended to the resolved base URL.
    pub path: String,
    pub method: &'static str,
}

/// Response from `send_instant`.
#[derive(Debug, Clone)]
pub struct InstantResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    body: Value,
}

impl InstantResponse {
    pub fn new(ok: bool, status: u16, status_text: String, body: Value) -> Self {
        Self {
            ok,
            status,
            status_text,
            body,
        }
    }

    pub fn json(&self) -> &Value {
        &self.body
    }
}

/// Outbound network boundary.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget send of a finished envelope. Returns once the
    /// relay accepted the message on a best-effort basis.
    async fn send(&self, body: Value) -> Result<()>;

    /// Request/response exchange for the quorum endpoints.
    async fn send_instant(&self, request: InstantRequest) -> Result<InstantResponse>;
}

/// HTTP transport resolving actions against configured base URLs.
pub struct HttpTransport {
    client: reqwest::Client,
    /// Where fire-and-forget envelopes are POSTed.
    submit_url: String,
    /// action -> base URL for `send_instant`.
    endpoints: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(submit_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            submit_url: submit_url.into(),
            endpoints: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, action: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.endpoints.insert(action.into(), base_url.into());
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, body: Value) -> Result<()> {
        self.client
            .post(&self.submit_url)
            .json(&body)
            .send()
            .await
            .context("telemetry submit failed")?
            .error_for_status()
            .context("telemetry submit rejected")?;
        Ok(())
    }

    async fn send_instant(&self, request: InstantRequest) -> Result<InstantResponse> {
        let base = self
            .endpoints
            .get(&request.action)
            .with_context(|| format!("no endpoint for action {:?}", request.action))?;
        let url = format!("{}{}", base, request.path);
        let response = match request.method {
            "POST" => self.client.post(&url).send().await,
            _ => self.client.get(&url).send().await,
        }
        .context("instant request failed")?;

        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(InstantResponse::new(
            status.is_success(),
            status.as_u16(),
            status
                .canonical_reason()
                .unwrap_or("unknown")
                .to_string(),
            body,
        ))
    }
}

/// Test transport that forwards envelopes into an mpsc channel and
/// answers `send_instant` with canned responses.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Value>,
    instant_response: std::sync::Mutex<Option<Value>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                instant_response: std::sync::Mutex::new(None),
            },
            rx,
        )
    }

    /// Set the body returned by every subsequent `send_instant`.
    pub fn set_instant_response(&self, body: Value) {
        *self.instant_response.lock().unwrap() = Some(body);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, body: Value) -> Result<()> {
        self.tx.send(body).context("collector dropped")?;
        Ok(())
    }

    async fn send_instant(&self, _request: InstantRequest) -> Result<InstantResponse> {
        let body = self
            .instant_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Value::Null);
        Ok(InstantResponse::new(true, 200, "OK".into(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_required_fields() {
        let options = Options {
            platform: Some("desktop".into()),
            ..Options::default()
        };
        let msg = OutboundMessage {
            action: "wtm.page".into(),
            payload: json!({"url": "https://example.com/"}),
            ver: 1,
            deduplicate_by: Some("https://example.com/".into()),
        };
        let body = msg.envelope(&options, "20230517");
        assert_eq!(body["action"], "wtm.page");
        assert_eq!(body["ts"], "20230517");
        assert_eq!(body["channel"], "ext");
        assert_eq!(body["platform"], "desktop");
        assert!(body.get("userAgent").is_none());
        assert!(body["anti-duplicates"].is_u64());
    }

    #[test]
    fn envelope_has_exactly_one_anti_duplicates_field() {
        let msg = OutboundMessage {
            action: "wtm.page".into(),
            payload: json!({}),
            ver: 1,
            deduplicate_by: None,
        };
        let body = msg.envelope(&Options::default(), "20230517");
        let obj = body.as_object().unwrap();
        assert_eq!(
            obj.keys().filter(|k| *k == "anti-duplicates").count(),
            1
        );
    }

    #[tokio::test]
    async fn channel_transport_collects() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(json!({"action": "wtm.alive"})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()["action"], "wtm.alive");
    }
}
