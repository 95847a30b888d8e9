//! Core types for Wiregate
//!
//! Plain data records only: persistence lives behind the registries in
//! the daemon crate, and validation lives in `validate`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport protocol for a published TCP-style service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Default for Proto {
    fn default() -> Self {
        Self::Tcp
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Proto {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(format!("unknown proto: {}", s)),
        }
    }
}

/// Scheme used to reach an HTTP backend over the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProto {
    Http,
    Https,
}

impl Default for BackendProto {
    fn default() -> Self {
        Self::Http
    }
}

impl std::fmt::Display for BackendProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

impl std::str::FromStr for BackendProto {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => Err(format!("unknown backend proto: {}", s)),
        }
    }
}

/// A subnet routed into the mesh through a gateway node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayNetwork {
    pub subnet: String,
}

impl GatewayNetwork {
    pub fn new(subnet: impl Into<String>) -> Self {
        Self {
            subnet: subnet.into(),
        }
    }
}

/// A registered VPN peer, possibly the controller's own host.
///
/// `public_key`/`private_key` are absent for the local node, which uses
/// the host interface's own identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    /// Tunnel-internal address, unique among nodes on the same interface.
    pub address: String,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    /// WireGuard interface this peer belongs to.
    pub wg_interface: String,
    pub is_gateway: bool,
    pub is_local: bool,
    /// Whether this peer is additionally granted a default route.
    pub allow_internet: bool,
    pub enabled: bool,
    pub gateway_networks: Vec<GatewayNetwork>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Request parameters for creating or reshaping a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeParams {
    pub name: String,
    /// Requested tunnel address; allocated automatically when absent.
    pub address: Option<String>,
    pub is_gateway: bool,
    pub allow_internet: bool,
    pub enabled: bool,
    pub gateway_networks: Vec<GatewayNetwork>,
}

/// Partial update applied to an existing node. Absent fields keep
/// their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub is_gateway: Option<bool>,
    pub allow_internet: Option<bool>,
    pub enabled: Option<bool>,
    pub gateway_networks: Option<Vec<GatewayNetwork>>,
}

/// Allocation result ready to persist as a node record.
#[derive(Debug, Clone)]
pub struct NodeDraft {
    pub name: String,
    pub address: String,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub wg_interface: String,
    pub is_gateway: bool,
    pub is_local: bool,
    pub allow_internet: bool,
    pub enabled: bool,
    pub gateway_networks: Vec<GatewayNetwork>,
}

/// Runtime view of a node: registry record plus live interface state.
///
/// Recomputed on every query, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    #[serde(flatten)]
    pub node: Node,
    pub connected: bool,
    pub last_handshake: Option<i64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub latency_ms: Option<f64>,
}

/// Node record paired with a freshly issued bearer token.
///
/// The plaintext token is only available at issue time.
#[derive(Debug, Clone, Serialize)]
pub struct NodeWithToken {
    #[serde(flatten)]
    pub node: Node,
    pub token: String,
}

/// HTTP backend published through the reverse proxy under a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpService {
    pub id: Uuid,
    pub node_id: Uuid,
    pub name: String,
    pub domain: String,
    pub backend_proto: BackendProto,
    /// Absent means the owning node's tunnel address.
    pub backend_host: Option<String>,
    pub backend_port: u16,
    pub ssl: bool,
    pub allowed_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub enabled: bool,
    pub ttl: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

/// TCP/UDP backend published through the reverse proxy under a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpService {
    pub id: Uuid,
    pub node_id: Uuid,
    pub name: String,
    pub proto: Proto,
    /// Public listener port, globally unique among enabled services.
    pub port: u16,
    /// Absent means the owning node's tunnel address.
    pub backend_host: Option<String>,
    pub backend_port: u16,
    pub allowed_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub enabled: bool,
    pub ttl: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

/// Opaque bearer credential scoped to a node. Only the hash is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: Uuid,
    pub node_id: Uuid,
    pub name: String,
    pub token_hash: String,
    pub created_at: i64,
    pub revoked_at: Option<i64>,
}

impl AccessToken {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_round_trip() {
        assert_eq!("udp".parse::<Proto>().unwrap(), Proto::Udp);
        assert_eq!(Proto::Tcp.to_string(), "tcp");
        assert!("sctp".parse::<Proto>().is_err());
    }

    #[test]
    fn test_backend_proto_round_trip() {
        assert_eq!("https".parse::<BackendProto>().unwrap(), BackendProto::Https);
        assert_eq!(BackendProto::Http.to_string(), "http");
    }
}
