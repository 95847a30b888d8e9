//! WireGuard engine.
//!
//! Owns the managed tunnel interfaces: keypair generation, tunnel
//! address allocation, interface/peer config rendering, full-replace
//! apply, client config export and live runtime info.
//!
//! `apply_configuration` is the reconciliation primitive: it rebuilds
//! every interface from current registry state as one atomic replace,
//! never an incremental diff, and is safe to call repeatedly. A failed
//! apply leaves the registry and live tunnel transiently divergent;
//! the next apply repairs it.

use crate::config::{WgConfig, WgInterfaceConfig};
use crate::registry::NodeRegistry;
use crate::sync::Coalesce;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::stream::{self, StreamExt};
use ipnetwork::Ipv4Network;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};
use wiregate_common::{Error, Node, NodeDraft, NodeInfo, NodeParams, Result};

/// Handshakes older than this mean the peer is not connected.
const HANDSHAKE_FRESH_SECS: i64 = 180;

/// How many reachability probes run at once.
const PROBE_CONCURRENCY: usize = 8;

/// Per-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// WireGuard keypair, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// Generate a WireGuard keypair using x25519. Pure, no side effects.
pub fn generate_keypair() -> WgKeyPair {
    let mut private_key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private_key_bytes);

    // WireGuard key clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    use x25519_dalek::{PublicKey, StaticSecret};
    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        public_key: STANDARD.encode(public.as_bytes()),
        private_key: STANDARD.encode(private_key_bytes),
    }
}

/// Live per-peer counters parsed from the interface.
#[derive(Debug, Clone, Default)]
struct PeerStats {
    last_handshake: Option<i64>,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Control surface over the running tunnel interfaces.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Replace the running configuration of `interface` with `config`.
    async fn apply(&self, interface: &str, config: &str) -> Result<()>;

    /// Raw `wg show <interface> dump` output.
    async fn dump(&self, interface: &str) -> Result<String>;

    /// Bounded reachability probe; round-trip latency in ms on success.
    async fn probe(&self, address: &str) -> Option<f64>;
}

/// Shell-out implementation over `wg`/`wg-quick`/`ping`.
pub struct WgCli {
    config_dir: PathBuf,
}

impl WgCli {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }
}

#[async_trait]
impl TunnelControl for WgCli {
    async fn apply(&self, interface: &str, config: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let path = self.config_dir.join(format!("{}.conf", interface));
        tokio::fs::write(&path, config).await?;

        // syncconf replaces peers without tearing the interface down
        let output = Command::new("bash")
            .arg("-c")
            .arg(format!(
                "wg syncconf {} <(wg-quick strip {})",
                interface,
                path.display()
            ))
            .output()
            .await
            .map_err(|e| Error::Reconciliation(format!("failed to run wg syncconf: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Reconciliation(format!(
                "wg syncconf {}: {}",
                interface,
                stderr.trim()
            )));
        }

        info!("Applied configuration to {}", interface);
        Ok(())
    }

    async fn dump(&self, interface: &str) -> Result<String> {
        let output = Command::new("wg")
            .args(["show", interface, "dump"])
            .output()
            .await
            .map_err(|e| Error::Reconciliation(format!("failed to run wg show: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Reconciliation(format!(
                "wg show {} dump: {}",
                interface,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn probe(&self, address: &str) -> Option<f64> {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new("ping")
                .args(["-c", "1", "-W", "1", address])
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                Some(started.elapsed().as_secs_f64() * 1000.0)
            }
            _ => None,
        }
    }
}

/// The VPN engine proper.
pub struct WgEngine {
    config: WgConfig,
    registry: NodeRegistry,
    tunnel: Arc<dyn TunnelControl>,
    server_keys: HashMap<String, WgKeyPair>,
    apply_guard: Coalesce,
}

impl WgEngine {
    /// Build the engine, loading or generating one server keypair per
    /// managed interface under `wg_dir`.
    pub fn new(
        config: WgConfig,
        wg_dir: PathBuf,
        registry: NodeRegistry,
        tunnel: Arc<dyn TunnelControl>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&wg_dir)?;

        let mut server_keys = HashMap::new();
        for iface in &config.interfaces {
            let key_path = wg_dir.join(format!("{}.key", iface.name));
            let keys = if key_path.exists() {
                let raw = std::fs::read_to_string(&key_path)?;
                serde_json::from_str(&raw)?
            } else {
                let keys = generate_keypair();
                std::fs::write(&key_path, serde_json::to_string(&keys)?)?;
                info!("Generated server keypair for {}", iface.name);
                keys
            };
            server_keys.insert(iface.name.clone(), keys);
        }

        Ok(Self {
            config,
            registry,
            tunnel,
            server_keys,
            apply_guard: Coalesce::new(),
        })
    }

    /// Derive a free tunnel address on the target interface and, unless
    /// the node is local, a fresh keypair. Returns a draft ready to
    /// persist; no registry mutation happens here.
    pub fn allocate_client_params(
        &self,
        params: &NodeParams,
        interface: Option<&str>,
        is_local: bool,
    ) -> Result<NodeDraft> {
        let iface = self
            .config
            .interface(interface)
            .ok_or_else(|| {
                Error::validation(
                    "wg_interface",
                    format!("unknown tunnel interface: {}", interface.unwrap_or("")),
                )
            })?
            .clone();

        let subnet: Ipv4Network = iface
            .subnet
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad subnet for {}", iface.name)))?;

        let used: HashSet<String> = self
            .registry
            .list_addresses(&iface.name)?
            .into_iter()
            .collect();

        let address = match &params.address {
            Some(requested) => {
                let parsed: Ipv4Addr = requested.parse().map_err(|_| {
                    Error::validation("address", format!("invalid address: {}", requested))
                })?;
                if !subnet.contains(parsed) {
                    return Err(Error::validation(
                        "address",
                        format!("{} outside tunnel subnet {}", requested, iface.subnet),
                    ));
                }
                if used.contains(requested) {
                    return Err(Error::validation(
                        "address",
                        format!("{} already in use", requested),
                    ));
                }
                requested.clone()
            }
            None => allocate_address(&subnet, &used, is_local).ok_or(
                Error::AllocationExhausted {
                    interface: iface.name.clone(),
                },
            )?,
        };

        let keys = if is_local {
            None
        } else {
            Some(generate_keypair())
        };

        Ok(NodeDraft {
            name: params.name.clone(),
            address,
            public_key: keys.as_ref().map(|k| k.public_key.clone()),
            private_key: keys.as_ref().map(|k| k.private_key.clone()),
            wg_interface: iface.name,
            is_gateway: params.is_gateway,
            is_local,
            allow_internet: params.allow_internet,
            enabled: params.enabled,
            gateway_networks: params.gateway_networks.clone(),
        })
    }

    /// Rebuild every managed interface from current registry state and
    /// apply it as one full replace. Overlapping calls collapse; the
    /// winning apply always reads the latest registry state.
    pub async fn apply_configuration(&self) -> Result<()> {
        self.apply_guard
            .run(|| async {
                let nodes = self.registry.list()?;
                for iface in &self.config.interfaces {
                    let config = self.render_interface_config(iface, &nodes)?;
                    self.tunnel.apply(&iface.name, &config).await?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Render the full server-side config for one interface. Disabled
    /// nodes are withdrawn from the peer set but stay in the registry.
    fn render_interface_config(
        &self,
        iface: &WgInterfaceConfig,
        nodes: &[Node],
    ) -> Result<String> {
        let keys = self
            .server_keys
            .get(&iface.name)
            .ok_or_else(|| Error::Internal(format!("no server keys for {}", iface.name)))?;
        let subnet: Ipv4Network = iface
            .subnet
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad subnet for {}", iface.name)))?;
        let server_addr = first_usable(&subnet)
            .ok_or_else(|| Error::InvalidConfig(format!("subnet too small: {}", iface.subnet)))?;

        let mut out = format!(
            "# {iface} - managed by wiregated, do not edit\n\
             [Interface]\n\
             Address = {addr}/{prefix}\n\
             ListenPort = {port}\n\
             PrivateKey = {key}\n",
            iface = iface.name,
            addr = server_addr,
            prefix = subnet.prefix(),
            port = iface.port,
            key = keys.private_key,
        );

        for node in nodes {
            if node.wg_interface != iface.name || node.is_local || !node.enabled {
                continue;
            }
            let Some(public_key) = &node.public_key else {
                continue;
            };

            let mut allowed = vec![format!("{}/32", node.address)];
            if node.is_gateway {
                allowed.extend(node.gateway_networks.iter().map(|n| n.subnet.clone()));
            }

            out.push_str(&format!(
                "\n# {name}\n\
                 [Peer]\n\
                 PublicKey = {key}\n\
                 AllowedIPs = {allowed}\n\
                 PersistentKeepalive = {keepalive}\n",
                name = node.name,
                key = public_key,
                allowed = allowed.join(", "),
                keepalive = self.config.keepalive,
            ));
        }

        Ok(out)
    }

    /// Render the node's own peer-side config for download. Bit-exact
    /// standard tunnel config text, parseable by off-the-shelf clients.
    pub fn client_config(&self, node: &Node) -> Result<String> {
        if node.is_local {
            return Err(Error::Immutable(
                "local node has no exportable client configuration".to_string(),
            ));
        }
        let private_key = node
            .private_key
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("node {} has no private key", node.id)))?;
        let iface = self.config.interface(Some(&node.wg_interface)).ok_or_else(|| {
            Error::Internal(format!("node on unmanaged interface {}", node.wg_interface))
        })?;
        let keys = self
            .server_keys
            .get(&iface.name)
            .ok_or_else(|| Error::Internal(format!("no server keys for {}", iface.name)))?;

        let dns_line = self
            .config
            .dns
            .as_ref()
            .map(|d| format!("DNS = {}\n", d))
            .unwrap_or_default();

        let mut allowed = vec![iface.subnet.clone()];
        if node.allow_internet {
            allowed.push("0.0.0.0/0".to_string());
            allowed.push("::/0".to_string());
        }

        Ok(format!(
            "[Interface]\n\
             PrivateKey = {private_key}\n\
             Address = {address}/32\n\
             {dns_line}\n\
             [Peer]\n\
             PublicKey = {server_key}\n\
             AllowedIPs = {allowed}\n\
             Endpoint = {host}:{port}\n\
             PersistentKeepalive = {keepalive}\n",
            private_key = private_key,
            address = node.address,
            dns_line = dns_line,
            server_key = keys.public_key,
            allowed = allowed.join(", "),
            host = self.config.host,
            port = iface.port,
            keepalive = self.config.keepalive,
        ))
    }

    /// Live runtime view for the given nodes. Probing is opt-in: it
    /// costs latency proportional to node count, so bulk listings skip
    /// it by default. Probes run with bounded concurrency.
    pub async fn runtime_info(
        &self,
        nodes: Vec<Node>,
        interface: Option<&str>,
        probe: bool,
    ) -> Result<Vec<NodeInfo>> {
        let nodes: Vec<Node> = nodes
            .into_iter()
            .filter(|n| interface.map_or(true, |i| n.wg_interface == i))
            .collect();

        let mut stats: HashMap<String, PeerStats> = HashMap::new();
        let interfaces: HashSet<&str> = nodes.iter().map(|n| n.wg_interface.as_str()).collect();
        for iface in interfaces {
            match self.tunnel.dump(iface).await {
                Ok(dump) => stats.extend(parse_wg_dump(&dump)),
                Err(e) => warn!("Failed to read runtime state of {}: {}", iface, e),
            }
        }

        let latencies: HashMap<String, Option<f64>> = if probe {
            stream::iter(nodes.iter().map(|n| {
                let address = n.address.clone();
                async move {
                    let latency = self.tunnel.probe(&address).await;
                    (address, latency)
                }
            }))
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await
        } else {
            HashMap::new()
        };

        let now = wiregate_common::now_epoch_secs();
        let infos = nodes
            .into_iter()
            .map(|node| {
                let peer = node
                    .public_key
                    .as_ref()
                    .and_then(|k| stats.get(k))
                    .cloned()
                    .unwrap_or_default();
                let latency_ms = latencies.get(&node.address).copied().flatten();
                let connected = if probe {
                    latency_ms.is_some()
                } else {
                    peer.last_handshake
                        .map_or(false, |ts| now - ts < HANDSHAKE_FRESH_SECS)
                };
                NodeInfo {
                    connected,
                    last_handshake: peer.last_handshake,
                    rx_bytes: peer.rx_bytes,
                    tx_bytes: peer.tx_bytes,
                    latency_ms,
                    node,
                }
            })
            .collect();

        Ok(infos)
    }

    /// Public key of the managed interface's server identity.
    pub fn server_public_key(&self, interface: &str) -> Option<&str> {
        self.server_keys
            .get(interface)
            .map(|k| k.public_key.as_str())
    }
}

/// Parse `wg show <iface> dump` output into per-peer stats keyed by
/// public key. The first line describes the interface itself; peer
/// lines carry eight tab-separated fields.
fn parse_wg_dump(dump: &str) -> HashMap<String, PeerStats> {
    let mut stats = HashMap::new();
    for line in dump.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            continue;
        }
        let handshake: i64 = fields[4].parse().unwrap_or(0);
        stats.insert(
            fields[0].to_string(),
            PeerStats {
                last_handshake: (handshake > 0).then_some(handshake),
                rx_bytes: fields[5].parse().unwrap_or(0),
                tx_bytes: fields[6].parse().unwrap_or(0),
            },
        );
    }
    stats
}

/// First usable host in a subnet, reserved for the controller itself.
fn first_usable(subnet: &Ipv4Network) -> Option<Ipv4Addr> {
    subnet
        .iter()
        .find(|a| *a != subnet.network() && *a != subnet.broadcast())
}

fn allocate_address(
    subnet: &Ipv4Network,
    used: &HashSet<String>,
    is_local: bool,
) -> Option<String> {
    let server = first_usable(subnet)?;
    if is_local {
        let addr = server.to_string();
        return (!used.contains(&addr)).then_some(addr);
    }
    subnet
        .iter()
        .filter(|a| *a != subnet.network() && *a != subnet.broadcast() && *a != server)
        .map(|a| a.to_string())
        .find(|a| !used.contains(a))
}
