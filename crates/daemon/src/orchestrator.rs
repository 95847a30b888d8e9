//! Node orchestrator.
//!
//! Drives the full node lifecycle: allocation, persistence, tunnel
//! reconciliation, gateway route maintenance, token issue/revocation
//! and service withdrawal. Mutations for any node are serialized
//! behind one lock; interleaving two route withdraw/add sequences
//! corrupts the route table. Registry writes commit before live-system
//! mutations, so a failed reconciliation leaves declared and live
//! state transiently divergent until the next apply repairs it.

use crate::netlink::RouteSync;
use crate::registry::NodeRegistry;
use crate::services::{HttpServices, TcpServices};
use crate::tokens::TokenIssuer;
use crate::wg::WgEngine;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use wiregate_common::{
    validate, AccessToken, Error, Node, NodeInfo, NodeParams, NodeUpdate, NodeWithToken, Result,
};

pub struct NodeOrchestrator {
    registry: NodeRegistry,
    engine: Arc<WgEngine>,
    routes: Arc<dyn RouteSync>,
    tokens: TokenIssuer,
    http: Arc<HttpServices>,
    tcp: Arc<TcpServices>,
    // Global, not per-node: node counts are small and the critical
    // sections are short.
    op_lock: Mutex<()>,
}

impl NodeOrchestrator {
    pub fn new(
        registry: NodeRegistry,
        engine: Arc<WgEngine>,
        routes: Arc<dyn RouteSync>,
        tokens: TokenIssuer,
        http: Arc<HttpServices>,
        tcp: Arc<TcpServices>,
    ) -> Self {
        Self {
            registry,
            engine,
            routes,
            tokens,
            http,
            tcp,
            op_lock: Mutex::new(()),
        }
    }

    /// Bring declared state back onto the host: ensure the local node
    /// exists, restore gateway routes, and apply the tunnel config.
    pub async fn initialize(&self, local_name: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        if self.registry.local_node()?.is_none() {
            let params = NodeParams {
                name: local_name.to_string(),
                enabled: true,
                ..Default::default()
            };
            let draft = self.engine.allocate_client_params(&params, None, true)?;
            let node = self.registry.insert(&draft)?;
            info!("Bootstrapped local node {} at {}", node.name, node.address);
        }

        for node in self.registry.list_gateways()? {
            if !node.enabled {
                continue;
            }
            self.add_gateway_routes(&node).await?;
        }

        self.engine.apply_configuration().await
    }

    /// Register a new node: allocate, persist, reconcile, route, and
    /// hand back the record with its one-time default token.
    pub async fn create_node(
        &self,
        params: NodeParams,
        interface: Option<&str>,
    ) -> Result<NodeWithToken> {
        let _guard = self.op_lock.lock().await;
        validate_node_params(&params.name, params.is_gateway, &params.gateway_networks)?;

        let draft = self.engine.allocate_client_params(&params, interface, false)?;
        let node = self.registry.insert(&draft)?;
        info!("Created node {} at {}", node.name, node.address);

        self.engine.apply_configuration().await?;
        if node.is_gateway && node.enabled {
            self.add_gateway_routes(&node).await?;
        }

        let issued = self.tokens.issue(node.id, "default")?;
        Ok(NodeWithToken {
            node,
            token: issued.token,
        })
    }

    pub fn get_node(&self, id: Uuid) -> Result<Node> {
        self.registry.get_required(id)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.registry.list()
    }

    /// Live runtime view of one node.
    pub async fn node_info(&self, id: Uuid, probe: bool) -> Result<NodeInfo> {
        let node = self.registry.get_required(id)?;
        let mut infos = self.engine.runtime_info(vec![node], None, probe).await?;
        infos.pop().ok_or_else(|| Error::not_found("node", id))
    }

    /// Live runtime view of all nodes, optionally scoped to one
    /// tunnel interface.
    pub async fn list_info(&self, interface: Option<&str>, probe: bool) -> Result<Vec<NodeInfo>> {
        let nodes = self.registry.list()?;
        self.engine.runtime_info(nodes, interface, probe).await
    }

    /// Exportable client tunnel configuration for a node.
    pub fn node_config(&self, id: Uuid) -> Result<String> {
        let node = self.registry.get_required(id)?;
        self.engine.client_config(&node)
    }

    /// Apply a partial update. Existing gateway routes are always
    /// withdrawn first, even when the node stays a gateway: the
    /// network set may have changed underneath them.
    pub async fn update_node(&self, id: Uuid, update: NodeUpdate) -> Result<Node> {
        let _guard = self.op_lock.lock().await;
        let current = self.registry.get_required(id)?;
        // The local node is the controller's own host identity; it is
        // never disabled, never a gateway routing via itself.
        if current.is_local {
            return Err(Error::Immutable("local node cannot be updated".to_string()));
        }

        let mut next = current.clone();
        if let Some(name) = update.name {
            next.name = name;
        }
        if let Some(is_gateway) = update.is_gateway {
            next.is_gateway = is_gateway;
        }
        if let Some(allow_internet) = update.allow_internet {
            next.allow_internet = allow_internet;
        }
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(networks) = update.gateway_networks {
            next.gateway_networks = networks;
        }
        if !next.is_gateway {
            next.gateway_networks.clear();
        }
        validate_node_params(&next.name, next.is_gateway, &next.gateway_networks)?;

        if current.is_gateway {
            self.withdraw_gateway_routes(&current).await?;
        }

        self.registry.update(&next)?;
        let node = self.registry.get_required(id)?;

        self.engine.apply_configuration().await?;
        if node.is_gateway && node.enabled {
            self.add_gateway_routes(&node).await?;
        }

        // Enable/disable changes which services the proxy serves
        if current.enabled != node.enabled {
            self.http.initialize().await?;
            self.tcp.initialize().await?;
        }

        Ok(node)
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Node> {
        self.update_node(
            id,
            NodeUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Remove a node for good. Services, routes and tokens go with it.
    pub async fn delete_node(&self, id: Uuid) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let node = self.registry.get_required(id)?;
        if node.is_local {
            return Err(Error::Immutable("local node cannot be deleted".to_string()));
        }

        if node.is_gateway {
            self.withdraw_gateway_routes(&node).await?;
        }

        // Services and tokens cascade with the record
        self.registry.delete(id)?;
        info!("Deleted node {}", node.name);

        self.engine.apply_configuration().await?;
        self.http.initialize().await?;
        self.tcp.initialize().await?;
        Ok(())
    }

    /// Rotate a node's keys and tunnel address in place. Identity is
    /// preserved; every previously issued token is revoked and one
    /// fresh default token is handed back.
    pub async fn regenerate_credentials(&self, id: Uuid) -> Result<NodeWithToken> {
        let _guard = self.op_lock.lock().await;
        let node = self.registry.get_required(id)?;
        if node.is_local {
            return Err(Error::Immutable(
                "local node credentials cannot be regenerated".to_string(),
            ));
        }

        let params = NodeParams {
            name: node.name.clone(),
            address: None,
            is_gateway: node.is_gateway,
            allow_internet: node.allow_internet,
            enabled: node.enabled,
            gateway_networks: node.gateway_networks.clone(),
        };
        let draft = self
            .engine
            .allocate_client_params(&params, Some(&node.wg_interface), false)?;
        self.registry.replace_credentials(id, &draft)?;

        let revoked = self.tokens.revoke_all(id)?;
        info!("Rotated credentials for {} ({} tokens revoked)", node.name, revoked);
        let issued = self.tokens.issue(id, "default")?;

        self.engine.apply_configuration().await?;

        let node = self.registry.get_required(id)?;
        Ok(NodeWithToken {
            node,
            token: issued.token,
        })
    }

    pub fn issue_token(&self, node_id: Uuid, name: &str) -> Result<(AccessToken, String)> {
        self.registry.get_required(node_id)?;
        let issued = self.tokens.issue(node_id, name)?;
        Ok((issued.record, issued.token))
    }

    pub fn revoke_token(&self, token_id: Uuid) -> Result<()> {
        self.tokens.revoke(token_id)
    }

    pub fn list_tokens(&self, node_id: Uuid) -> Result<Vec<AccessToken>> {
        self.registry.get_required(node_id)?;
        self.tokens.list(node_id)
    }

    async fn add_gateway_routes(&self, node: &Node) -> Result<()> {
        for net in &node.gateway_networks {
            self.routes
                .add_route(&net.subnet, &node.address, &node.wg_interface)
                .await?;
        }
        Ok(())
    }

    async fn withdraw_gateway_routes(&self, node: &Node) -> Result<()> {
        for net in &node.gateway_networks {
            if let Err(e) = self.routes.del_route(&net.subnet, &node.address).await {
                // Keep withdrawing; a stale leftover beats a stuck delete
                warn!("Failed to withdraw route {}: {}", net.subnet, e);
            }
        }
        Ok(())
    }
}

fn validate_node_params(
    name: &str,
    is_gateway: bool,
    networks: &[wiregate_common::GatewayNetwork],
) -> Result<()> {
    let mut errors = Vec::new();
    if name.trim().is_empty() {
        errors.push(wiregate_common::FieldError::new("name", "name is required"));
    }
    if !is_gateway && !networks.is_empty() {
        errors.push(wiregate_common::FieldError::new(
            "gateway_networks",
            "gateway networks require is_gateway",
        ));
    }
    for net in networks {
        if let Some(e) = validate::check_subnet("gateway_networks", &net.subnet) {
            errors.push(e);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors))
    }
}
