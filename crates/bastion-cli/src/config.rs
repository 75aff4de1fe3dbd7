//! Global CLI configuration
//!
//! Optional settings stored in ~/.bastion/config.json. Every field has a
//! default, so a missing file or a partial one is fine.

use anyhow::{Context, Result};
use bastion_control::{ConnectorConfig, ServerConfig};
use bastion_proto::{HostPort, DEFAULT_CONTROL_BASE_PORT};
use bastion_tunnel::socks::DEFAULT_SOCKS_PORT;
use bastion_tunnel::SshTransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global CLI configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BastionConfig {
    /// Attempts made to reach the daemon before giving up
    pub connect_attempts: u32,
    /// Pause between attempts, in seconds
    pub retry_backoff_secs: u64,
    /// First port tried for the daemon's control endpoint
    pub control_base_port: u16,
    /// SSH keep-alive interval in seconds; 0 disables keep-alives
    pub keepalive_secs: u64,
    /// SOCKS5 proxy (`host[:port]`) used to reach bastions
    pub socks_proxy: Option<String>,
}

impl Default for BastionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            retry_backoff_secs: 5,
            control_base_port: DEFAULT_CONTROL_BASE_PORT,
            keepalive_secs: 10,
            socks_proxy: None,
        }
    }
}

impl BastionConfig {
    pub fn connector_config(&self, state_file: &Path) -> ConnectorConfig {
        let mut config = ConnectorConfig::new(state_file);
        config.attempts = self.connect_attempts.max(1);
        config.backoff = Duration::from_secs(self.retry_backoff_secs);
        config
    }

    pub fn server_config(&self, state_file: &Path) -> ServerConfig {
        ServerConfig::new(state_file).with_base_port(self.control_base_port)
    }

    pub fn transport_config(&self) -> Result<SshTransportConfig> {
        let socks_proxy = match self.socks_proxy.as_deref() {
            Some(proxy) if !proxy.trim().is_empty() => Some(
                HostPort::parse(proxy, DEFAULT_SOCKS_PORT)
                    .with_context(|| format!("Invalid SOCKS proxy address: {}", proxy))?,
            ),
            _ => None,
        };

        let keepalive = match self.keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(SshTransportConfig {
            keepalive,
            socks_proxy,
        })
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Default config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".bastion").join("config.json"))
    }

    /// Load the configuration from the default location
    pub fn load() -> Result<BastionConfig> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load the configuration from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<BastionConfig> {
        if !path.exists() {
            return Ok(BastionConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: BastionConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }
}
