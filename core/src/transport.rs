//! HTTP transport for the Mallu REST API

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::models::*;
use crate::ClientConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

const PLACEHOLDER_PHOTO: &str = "https://via.placeholder.com/150";

/// Remote operations the chat screen depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn history(&self, partner: UserId) -> Result<ConversationHistory>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage>;
    async fn send_typing(&self, receiver: UserId) -> Result<()>;
    async fn start_call(&self, receiver: UserId) -> Result<CallRecord>;
    async fn answer_call(&self, call_id: CallId) -> Result<()>;
    async fn end_call(&self, call_id: CallId) -> Result<()>;
    async fn poll_calls(&self) -> Result<CallPoll>;
    async fn profile(&self, user_id: UserId) -> Result<PartnerProfile>;
    async fn report(&self, user_id: UserId, reason: ReportReason, explanation: &str) -> Result<()>;
    async fn block(&self, user_id: UserId) -> Result<()>;
}

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    http: Client,
    config: ClientConfig,
    credentials: Arc<Credentials>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, credentials: Arc<Credentials>) -> Result<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            http,
            config: config.clone(),
            credentials,
        })
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self.config.api_url(path);
        let mut req = self.http.request(method.clone(), &url);

        if let Some(session) = self.credentials.current() {
            req = req.header("Authorization", session.bearer());
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("{} {} rejected with 401", method, path);
            self.credentials.invalidate();
            return Err(Error::Unauthorized);
        }

        let bytes = resp.bytes().await?;

        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: server_message(&bytes),
            });
        }

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        let mut data: Value = serde_json::from_slice(&bytes)?;
        upgrade_insecure_urls(&mut data);
        Ok(data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let data = self.request(Method::GET, path, None).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let data = self.request(Method::POST, path, Some(body)).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn post_ack(&self, path: &str, body: Value) -> Result<()> {
        self.request(Method::POST, path, Some(body)).await?;
        Ok(())
    }

    pub fn photo_url(&self, path: Option<&str>) -> String {
        resolve_media_url(&self.config, path)
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn history(&self, partner: UserId) -> Result<ConversationHistory> {
        let resp: HistoryResponse = self.get(&format!("messages/?user_id={}", partner)).await?;
        Ok(resp.into())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        self.post("messages/", serde_json::to_value(request)?).await
    }

    async fn send_typing(&self, receiver: UserId) -> Result<()> {
        self.post_ack("chat/typing/", json!({ "receiver_id": receiver })).await
    }

    async fn start_call(&self, receiver: UserId) -> Result<CallRecord> {
        self.post("calls/start/", json!({ "receiver": receiver })).await
    }

    async fn answer_call(&self, call_id: CallId) -> Result<()> {
        self.post_ack(&format!("calls/{}/answer/", call_id), json!({})).await
    }

    async fn end_call(&self, call_id: CallId) -> Result<()> {
        self.post_ack(&format!("calls/{}/end/", call_id), json!({})).await
    }

    async fn poll_calls(&self) -> Result<CallPoll> {
        self.get("calls/poll/").await
    }

    async fn profile(&self, user_id: UserId) -> Result<PartnerProfile> {
        self.get(&format!("profile/{}/", user_id)).await
    }

    async fn report(&self, user_id: UserId, reason: ReportReason, explanation: &str) -> Result<()> {
        self.post_ack(
            "report/",
            json!({
                "reported_user": user_id,
                "reason": reason,
                "explanation": explanation
            }),
        )
        .await
    }

    async fn block(&self, user_id: UserId) -> Result<()> {
        self.post_ack("block/", json!({ "blocked_user": user_id })).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn server_message(body: &[u8]) -> Option<String> {
    let data = serde_json::from_slice::<Value>(body).ok()?;
    ["error", "detail"]
        .iter()
        .find_map(|key| data[*key].as_str())
        .map(str::to_string)
}

fn is_local(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1")
}

/// Rewrites every plain `http://` string in a response to `https://`, except
/// for local development hosts.
pub fn upgrade_insecure_urls(value: &mut Value) {
    match value {
        Value::String(s) => {
            let upgraded = s
                .strip_prefix("http://")
                .filter(|_| !is_local(s))
                .map(|rest| format!("https://{}", rest));
            if let Some(upgraded) = upgraded {
                *s = upgraded;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(upgrade_insecure_urls),
        Value::Object(map) => map.values_mut().for_each(upgrade_insecure_urls),
        _ => {}
    }
}

/// Absolute URL for a media path returned by the API.
pub fn resolve_media_url(config: &ClientConfig, path: Option<&str>) -> String {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return PLACEHOLDER_PHOTO.to_string();
    };

    if path.starts_with("http") {
        if let Some(rest) = path.strip_prefix("http://") {
            if !is_local(path) {
                return format!("https://{}", rest);
            }
        }
        return path.to_string();
    }

    let origin = config.api_origin();
    if path.starts_with('/') {
        format!("{}{}", origin, path)
    } else {
        format!("{}/{}", origin, path)
    }
}
