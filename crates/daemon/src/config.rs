//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// WireGuard configuration
    pub wg: WgConfig,

    /// Reverse proxy configuration
    pub proxy: ProxyConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: wiregate_common::default_store_path(),
            wg: WgConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

/// WireGuard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgConfig {
    /// Publicly reachable endpoint host for peer configs
    pub host: String,

    /// DNS server pushed to clients, if any
    pub dns: Option<String>,

    /// Persistent keepalive interval in seconds
    pub keepalive: u16,

    /// Managed tunnel interfaces; the first entry is the default
    pub interfaces: Vec<WgInterfaceConfig>,
}

impl Default for WgConfig {
    fn default() -> Self {
        Self {
            host: "vpn.example.com".to_string(),
            dns: None,
            keepalive: 25,
            interfaces: vec![WgInterfaceConfig::default()],
        }
    }
}

/// A single managed WireGuard interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgInterfaceConfig {
    /// Interface name
    pub name: String,

    /// Tunnel-internal subnet; the first usable host is the controller
    pub subnet: String,

    /// UDP listen port
    pub port: u16,
}

impl Default for WgInterfaceConfig {
    fn default() -> Self {
        Self {
            name: "wg0".to_string(),
            subnet: "10.12.0.0/24".to_string(),
            port: 51820,
        }
    }
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Rendered HTTP virtual hosts land here (included from the http context)
    pub http_config_path: PathBuf,

    /// Rendered TCP/UDP listeners land here (included from the stream context)
    pub stream_config_path: PathBuf,

    /// Exposable public port range for TCP services, e.g. "9000-9999"
    pub port_range: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_config_path: PathBuf::from("/etc/nginx/conf.d/wiregate.conf"),
            stream_config_path: PathBuf::from("/etc/nginx/stream.d/wiregate.conf"),
            port_range: None,
        }
    }
}

impl ProxyConfig {
    /// Parse `port_range` into an inclusive range, if configured.
    pub fn exposable_range(&self) -> Option<(u16, u16)> {
        let raw = self.port_range.as_deref()?;
        let (lo, hi) = match raw.split_once('-') {
            Some((lo, hi)) => (lo.parse().ok()?, hi.parse().ok()?),
            None => {
                let p = raw.parse().ok()?;
                (p, p)
            }
        };
        Some((lo, hi))
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Directory holding rendered interface configs and server keys
    pub fn wg_dir(&self) -> PathBuf {
        self.store_path.join("wg")
    }
}

impl WgConfig {
    /// Look up a managed interface by name, or the default when absent.
    pub fn interface(&self, name: Option<&str>) -> Option<&WgInterfaceConfig> {
        match name {
            Some(n) => self.interfaces.iter().find(|i| i.name == n),
            None => self.interfaces.first(),
        }
    }
}
