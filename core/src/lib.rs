//! Mallu Core Library
//!
//! Client side of the Mallu chat screen: REST transport, live message
//! stream, peer-to-peer voice calls and the session that ties them together.

pub mod auth;
pub mod call;
pub mod chat;
pub mod error;
pub mod media;
pub mod models;
pub mod peer;
pub mod ringtone;
pub mod session;
pub mod signaling;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

use std::time::Duration;

pub use auth::{CredentialStore, Credentials, LoginRedirect, SessionContext};
pub use call::{CallMachine, CallPhase, CallSignal, CallView};
pub use chat::{ChatViewModel, Notice, NoticeLevel, TypingThrottle};
pub use error::{Error, Result};
pub use models::*;
pub use session::{ChatSession, SessionCommand, SessionDeps, SessionHandle, Snapshot};
pub use transport::{ApiClient, ChatApi};

/// Rendezvous server used to exchange call offers between peers.
#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
    pub key: String,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: "0.peerjs.com".to_string(),
            port: 443,
            secure: true,
            path: "/".to_string(),
            key: "peerjs".to_string(),
        }
    }
}

impl RendezvousConfig {
    pub fn socket_url(&self, peer_id: &str, token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.ends_with('/') {
            self.path.clone()
        } else {
            format!("{}/", self.path)
        };
        format!(
            "{}://{}:{}{}peerjs?key={}&id={}&token={}&version=1.5.4",
            scheme, self.host, self.port, path, self.key, peer_id, token
        )
    }
}

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// REST root, e.g. `https://api.example.com/api`.
    pub api_base_url: String,
    /// Push stream endpoint; derived from `api_base_url` when unset.
    pub stream_url: Option<String>,
    pub rendezvous: RendezvousConfig,
    pub ice_servers: Vec<String>,
    /// Prefix of the stable peer address every user registers under.
    pub peer_prefix: String,
    pub poll_interval: Duration,
    pub typing_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            stream_url: None,
            rendezvous: RendezvousConfig::default(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            peer_prefix: "mallu_user_".to_string(),
            poll_interval: Duration::from_secs(1),
            typing_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn new(api_base_url: &str) -> Self {
        Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Scheme and host of the API, without the `/api` suffix. Media files are
    /// served from here.
    pub fn api_origin(&self) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        base.strip_suffix("/api").unwrap_or(base).to_string()
    }

    pub fn stream_url(&self) -> Result<url::Url> {
        if let Some(ref explicit) = self.stream_url {
            return Ok(url::Url::parse(explicit)?);
        }
        let mut url = url::Url::parse(&self.api_origin())?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| Error::WebSocket(format!("cannot derive stream URL from {}", url)))?;
        url.set_path("/ws/chat/");
        Ok(url)
    }

    pub fn peer_address(&self, user_id: UserId) -> String {
        format!("{}{}", self.peer_prefix, user_id)
    }
}
