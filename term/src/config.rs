//! Configuration management for the Mallu terminal client

use mallu_core::{ClientConfig, RendezvousConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `server.api_base_url`.
pub const API_BASE_ENV: &str = "MALLU_API_BASE_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub calls: CallConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub api_base_url: String,
    /// Push stream URL; derived from the API URL when empty.
    pub stream_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub rendezvous_host: String,
    pub rendezvous_port: u16,
    pub rendezvous_secure: bool,
    pub rendezvous_path: String,
    pub rendezvous_key: String,
    pub ice_servers: Vec<String>,
    pub peer_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub poll_interval_ms: u64,
    pub typing_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            api_base_url: client.api_base_url,
            stream_url: None,
            timeout_secs: client.request_timeout.as_secs(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            rendezvous_host: client.rendezvous.host,
            rendezvous_port: client.rendezvous.port,
            rendezvous_secure: client.rendezvous.secure,
            rendezvous_path: client.rendezvous.path,
            rendezvous_key: client.rendezvous.key,
            ice_servers: client.ice_servers,
            peer_prefix: client.peer_prefix,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            typing_interval_ms: 2000,
        }
    }
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> anyhow::Result<Self> {
        let config_path = config_dir.join("config.json");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Client settings, with [`API_BASE_ENV`] taking precedence over the file.
    pub fn client_config(&self) -> ClientConfig {
        self.client_config_with(std::env::var(API_BASE_ENV).ok())
    }

    fn client_config_with(&self, api_override: Option<String>) -> ClientConfig {
        let api_base_url = api_override
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.server.api_base_url.clone());

        ClientConfig {
            stream_url: self.server.stream_url.clone().filter(|url| !url.is_empty()),
            rendezvous: RendezvousConfig {
                host: self.calls.rendezvous_host.clone(),
                port: self.calls.rendezvous_port,
                secure: self.calls.rendezvous_secure,
                path: self.calls.rendezvous_path.clone(),
                key: self.calls.rendezvous_key.clone(),
            },
            ice_servers: self.calls.ice_servers.clone(),
            peer_prefix: self.calls.peer_prefix.clone(),
            poll_interval: Duration::from_millis(self.chat.poll_interval_ms),
            typing_interval: Duration::from_millis(self.chat.typing_interval_ms),
            request_timeout: Duration::from_secs(self.server.timeout_secs),
            ..ClientConfig::new(&api_base_url)
        }
    }
}
