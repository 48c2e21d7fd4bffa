//! Client configuration

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Signaling server
    pub server: ServerConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket URL of the signaling server
    pub url: String,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TUN device name
    pub tun_name: String,
    /// Local UDP port (0 = ephemeral)
    pub local_port: u16,
    /// STUN server for public address discovery
    pub stun_server: String,
    /// TUN MTU
    pub mtu: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level for the application log
    pub level: String,
    /// Directory holding per-run log directories
    pub directory: String,
    /// Log network traffic to net.log
    pub log_traffic: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tun_name: "PeerBridge".to_string(),
            local_port: 0,
            stun_server: "stun.l.google.com:19302".to_string(),
            mtu: 1420,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: "logs".to_string(),
            log_traffic: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.url.is_empty() {
            anyhow::bail!("server.url must be set");
        }
        if !self.server.url.starts_with("ws://") && !self.server.url.starts_with("wss://") {
            anyhow::bail!("server.url must be a ws:// or wss:// URL");
        }
        if self.network.tun_name.is_empty() {
            anyhow::bail!("network.tun_name must be set");
        }
        if self.network.mtu < 576 || self.network.mtu > 1500 {
            anyhow::bail!("MTU must be between 576 and 1500");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.tun_name, "PeerBridge");
        assert_eq!(config.network.local_port, 0);
    }

    #[test]
    fn rejects_non_websocket_url() {
        let mut config = ClientConfig::default();
        config.server.url = "http://example.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ClientConfig =
            toml::from_str("[server]\nurl = \"wss://rendezvous.example\"\n").unwrap();
        assert_eq!(config.server.url, "wss://rendezvous.example");
        assert_eq!(config.network.stun_server, "stun.l.google.com:19302");
        assert!(!config.logging.log_traffic);
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = ClientConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.url, config.server.url);
        assert_eq!(parsed.network.mtu, config.network.mtu);
    }
}
