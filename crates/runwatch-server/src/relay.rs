//! HTTP adapters for the two external collaborators: the push relay and the
//! resource control endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwatch_alerts::{PushError, PushMessage, PushTransport};
use runwatch_core::{ControlError, ResourceControl, ResourceDescription, ResourceState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct RelayPush<'a> {
    target: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RelayReceipt {
    message_id: String,
}

/// POSTs pushes as JSON to a relay that owns the real provider credentials.
pub struct HttpPushTransport {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpPushTransport {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
        }
    }
}

/// Relay status codes that mean the target itself is unusable.
fn classify_push_status(status: u16, text: String) -> PushError {
    match status {
        404 | 410 => PushError::UnregisteredTarget(text),
        400 | 422 => PushError::InvalidTarget(text),
        _ => PushError::Transport(format!("relay returned HTTP {status}: {text}")),
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    fn name(&self) -> &str {
        "http-relay"
    }

    async fn send(&self, msg: &PushMessage) -> Result<String, PushError> {
        let body = RelayPush {
            target: &msg.target,
            title: &msg.title,
            body: &msg.body,
            data: &msg.data,
        };
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "push relay error");
            return Err(classify_push_status(status.as_u16(), text));
        }

        let receipt: RelayReceipt = resp
            .json()
            .await
            .map_err(|e| PushError::Transport(format!("bad relay receipt: {e}")))?;
        debug!(message_id = %receipt.message_id, "push accepted by relay");
        Ok(receipt.message_id)
    }
}

/// Used when no relay is configured: the push is logged and "accepted".
#[derive(Default)]
pub struct LogOnlyTransport {
    seq: AtomicU64,
}

#[async_trait]
impl PushTransport for LogOnlyTransport {
    fn name(&self) -> &str {
        "log-only"
    }

    async fn send(&self, msg: &PushMessage) -> Result<String, PushError> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        info!(title = %msg.title, body = %msg.body, "push (log only)");
        Ok(format!("local-{n}"))
    }
}

#[derive(Deserialize)]
struct DescribeResponse {
    state: String,
    launch_time: Option<DateTime<Utc>>,
}

/// `GET {url}/resources/{region}/{id}` and `POST .../stop`.
pub struct HttpResourceControl {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpResourceControl {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn resource_url(&self, resource_id: &str, region: &str) -> String {
        format!("{}/resources/{region}/{resource_id}", self.base_url)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl ResourceControl for HttpResourceControl {
    async fn describe(
        &self,
        resource_id: &str,
        region: &str,
    ) -> Result<ResourceDescription, ControlError> {
        let resp = self
            .authed(self.client.get(self.resource_url(resource_id, region)))
            .send()
            .await
            .map_err(|e| ControlError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(ControlError::NotFound {
                resource_id: resource_id.to_string(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ControlError::Unavailable(format!("HTTP {status}: {text}")));
        }

        let desc: DescribeResponse = resp
            .json()
            .await
            .map_err(|e| ControlError::Unavailable(format!("bad describe response: {e}")))?;
        let state: ResourceState = desc
            .state
            .parse()
            .map_err(ControlError::Unavailable)?;
        Ok(ResourceDescription {
            state,
            launch_time: desc.launch_time,
        })
    }

    async fn stop(&self, resource_id: &str, region: &str) -> Result<(), ControlError> {
        let url = format!("{}/stop", self.resource_url(resource_id, region));
        let resp = self
            .authed(self.client.post(url))
            .send()
            .await
            .map_err(|e| ControlError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Err(ControlError::NotFound {
                resource_id: resource_id.to_string(),
            }),
            400..=499 => Err(ControlError::Rejected(text)),
            _ => Err(ControlError::Unavailable(format!("HTTP {status}: {text}"))),
        }
    }
}
