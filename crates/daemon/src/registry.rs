//! Node registry: persistent store of nodes and their relations.
//!
//! Owns the schema for the whole controller state DB (nodes, gateway
//! networks, published services, access tokens). Entities are plain
//! records; all persistence goes through the repository structs.

use rusqlite::{params, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;
use wiregate_common::{Database, Error, GatewayNetwork, Node, NodeDraft, Result};

/// Repository over the node tables.
#[derive(Clone)]
pub struct NodeRegistry {
    db: Database,
}

impl NodeRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Initialize the controller schema. Safe to call repeatedly.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute_batch(
            r#"
            -- VPN nodes
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                public_key TEXT,
                private_key TEXT,
                wg_interface TEXT NOT NULL,
                is_gateway INTEGER NOT NULL DEFAULT 0,
                is_local INTEGER NOT NULL DEFAULT 0,
                allow_internet INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_address
                ON nodes(wg_interface, address);

            -- Subnets routed through a gateway node
            CREATE TABLE IF NOT EXISTS gateway_networks (
                node_id TEXT NOT NULL,
                subnet TEXT NOT NULL,
                PRIMARY KEY (node_id, subnet),
                FOREIGN KEY(node_id) REFERENCES nodes(id) ON DELETE CASCADE
            );

            -- HTTP services published through the proxy
            CREATE TABLE IF NOT EXISTS http_services (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                backend_proto TEXT NOT NULL DEFAULT 'http',
                backend_host TEXT,
                backend_port INTEGER NOT NULL,
                ssl INTEGER NOT NULL DEFAULT 0,
                allowed_ips TEXT NOT NULL DEFAULT '[]',
                blocked_ips TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1,
                ttl TEXT,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(node_id) REFERENCES nodes(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_http_services_node ON http_services(node_id);

            -- TCP/UDP services published through the proxy
            CREATE TABLE IF NOT EXISTS tcp_services (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                name TEXT NOT NULL,
                proto TEXT NOT NULL DEFAULT 'tcp',
                port INTEGER NOT NULL,
                backend_host TEXT,
                backend_port INTEGER NOT NULL,
                allowed_ips TEXT NOT NULL DEFAULT '[]',
                blocked_ips TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1,
                ttl TEXT,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(node_id) REFERENCES nodes(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_tcp_services_node ON tcp_services(node_id);

            -- Node-scoped bearer tokens (hash at rest)
            CREATE TABLE IF NOT EXISTS access_tokens (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                revoked_at INTEGER,
                FOREIGN KEY(node_id) REFERENCES nodes(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_access_tokens_node ON access_tokens(node_id);
            "#,
        )?;

        info!("Registry schema initialized");
        Ok(())
    }

    /// Persist a node draft, returning the stored record.
    pub fn insert(&self, draft: &NodeDraft) -> Result<Node> {
        let id = Uuid::new_v4();
        let now = wiregate_common::now_epoch_secs();

        let conn = self.db.connection();
        let conn = conn.lock();

        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM nodes WHERE wg_interface = ?1 AND address = ?2",
                params![draft.wg_interface, draft.address],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(Error::validation(
                "address",
                format!(
                    "tunnel address {} already in use on {}",
                    draft.address, draft.wg_interface
                ),
            ));
        }

        if draft.is_local {
            let local: Option<String> = conn
                .query_row("SELECT id FROM nodes WHERE is_local = 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            if local.is_some() {
                return Err(Error::validation("is_local", "a local node already exists"));
            }
        }

        conn.execute(
            "INSERT INTO nodes (id, name, address, public_key, private_key, wg_interface,
                                is_gateway, is_local, allow_internet, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id.to_string(),
                draft.name,
                draft.address,
                draft.public_key,
                draft.private_key,
                draft.wg_interface,
                draft.is_gateway,
                draft.is_local,
                draft.allow_internet,
                draft.enabled,
                now,
                now,
            ],
        )?;

        for net in &draft.gateway_networks {
            conn.execute(
                "INSERT INTO gateway_networks (node_id, subnet) VALUES (?1, ?2)",
                params![id.to_string(), net.subnet],
            )?;
        }

        drop(conn);
        self.get_required(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Node>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let node = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
                params![id.to_string()],
                row_to_node,
            )
            .optional()?;
        match node {
            Some(mut n) => {
                n.gateway_networks = load_networks(&conn, n.id)?;
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    pub fn get_required(&self, id: Uuid) -> Result<Node> {
        self.get(id)?.ok_or_else(|| Error::not_found("node", id))
    }

    pub fn list(&self) -> Result<Vec<Node>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes ORDER BY created_at",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_node)?;

        let mut nodes = Vec::new();
        for row in rows {
            let mut node = row?;
            node.gateway_networks = load_networks(&conn, node.id)?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Enabled gateway nodes, the input of route reconciliation.
    pub fn list_gateways(&self) -> Result<Vec<Node>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|n| n.is_gateway)
            .collect())
    }

    pub fn local_node(&self) -> Result<Option<Node>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let node = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE is_local = 1", NODE_COLUMNS),
                [],
                row_to_node,
            )
            .optional()?;
        match node {
            Some(mut n) => {
                n.gateway_networks = load_networks(&conn, n.id)?;
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    /// Tunnel addresses currently assigned on an interface.
    pub fn list_addresses(&self, interface: &str) -> Result<Vec<String>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT address FROM nodes WHERE wg_interface = ?1")?;
        let rows = stmt.query_map(params![interface], |row| row.get(0))?;
        let mut addrs = Vec::new();
        for row in rows {
            addrs.push(row?);
        }
        Ok(addrs)
    }

    /// Write back a full node record, replacing its gateway network set.
    pub fn update(&self, node: &Node) -> Result<()> {
        let now = wiregate_common::now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE nodes SET name = ?2, is_gateway = ?3, allow_internet = ?4,
                              enabled = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                node.id.to_string(),
                node.name,
                node.is_gateway,
                node.allow_internet,
                node.enabled,
                now,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("node", node.id));
        }

        conn.execute(
            "DELETE FROM gateway_networks WHERE node_id = ?1",
            params![node.id.to_string()],
        )?;
        for net in &node.gateway_networks {
            conn.execute(
                "INSERT INTO gateway_networks (node_id, subnet) VALUES (?1, ?2)",
                params![node.id.to_string(), net.subnet],
            )?;
        }
        Ok(())
    }

    /// Rotate a node's credentials and tunnel address in place. The
    /// node identity and everything else is preserved.
    pub fn replace_credentials(&self, id: Uuid, draft: &NodeDraft) -> Result<()> {
        let now = wiregate_common::now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE nodes SET address = ?2, public_key = ?3, private_key = ?4,
                              wg_interface = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                draft.address,
                draft.public_key,
                draft.private_key,
                draft.wg_interface,
                now,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("node", id));
        }
        Ok(())
    }

    /// Delete a node. Gateway networks, services and tokens cascade.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute("DELETE FROM nodes WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(Error::not_found("node", id));
        }
        Ok(())
    }
}

const NODE_COLUMNS: &str = "id, name, address, public_key, private_key, wg_interface, \
                            is_gateway, is_local, allow_internet, enabled, created_at, updated_at";

fn row_to_node(row: &Row) -> rusqlite::Result<Node> {
    Ok(Node {
        id: parse_uuid(row, 0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        public_key: row.get(3)?,
        private_key: row.get(4)?,
        wg_interface: row.get(5)?,
        is_gateway: row.get(6)?,
        is_local: row.get(7)?,
        allow_internet: row.get(8)?,
        enabled: row.get(9)?,
        gateway_networks: Vec::new(),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn parse_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn load_networks(
    conn: &rusqlite::Connection,
    node_id: Uuid,
) -> rusqlite::Result<Vec<GatewayNetwork>> {
    let mut stmt =
        conn.prepare("SELECT subnet FROM gateway_networks WHERE node_id = ?1 ORDER BY subnet")?;
    let rows = stmt.query_map(params![node_id.to_string()], |row| {
        Ok(GatewayNetwork {
            subnet: row.get(0)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> NodeRegistry {
        let db = Database::open_memory().unwrap();
        let registry = NodeRegistry::new(db);
        registry.init_schema().unwrap();
        registry
    }

    fn draft(name: &str, address: &str) -> NodeDraft {
        NodeDraft {
            name: name.to_string(),
            address: address.to_string(),
            public_key: Some(format!("{}-pub", name)),
            private_key: Some(format!("{}-priv", name)),
            wg_interface: "wg0".to_string(),
            is_gateway: false,
            is_local: false,
            allow_internet: false,
            enabled: true,
            gateway_networks: Vec::new(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let registry = test_registry();
        let node = registry.insert(&draft("laptop", "10.12.0.2")).unwrap();

        let fetched = registry.get_required(node.id).unwrap();
        assert_eq!(fetched.name, "laptop");
        assert_eq!(fetched.address, "10.12.0.2");
        assert!(fetched.enabled);
        assert!(!fetched.is_local);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = test_registry();
        registry.insert(&draft("a", "10.12.0.2")).unwrap();

        let err = registry.insert(&draft("b", "10.12.0.2")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_single_local_node() {
        let registry = test_registry();
        let mut local = draft("local", "10.12.0.1");
        local.is_local = true;
        local.public_key = None;
        local.private_key = None;
        registry.insert(&local).unwrap();

        let mut second = draft("other", "10.12.0.3");
        second.is_local = true;
        assert!(registry.insert(&second).is_err());

        let found = registry.local_node().unwrap().unwrap();
        assert_eq!(found.name, "local");
        assert!(found.public_key.is_none());
    }

    #[test]
    fn test_update_replaces_network_set() {
        let registry = test_registry();
        let mut node = registry.insert(&draft("gw", "10.12.0.2")).unwrap();

        node.is_gateway = true;
        node.gateway_networks = vec![GatewayNetwork::new("192.168.1.0/24")];
        registry.update(&node).unwrap();

        let fetched = registry.get_required(node.id).unwrap();
        assert!(fetched.is_gateway);
        assert_eq!(fetched.gateway_networks.len(), 1);

        let mut updated = fetched.clone();
        updated.gateway_networks = vec![
            GatewayNetwork::new("192.168.2.0/24"),
            GatewayNetwork::new("192.168.3.0/24"),
        ];
        registry.update(&updated).unwrap();

        let fetched = registry.get_required(node.id).unwrap();
        let subnets: Vec<_> = fetched
            .gateway_networks
            .iter()
            .map(|n| n.subnet.as_str())
            .collect();
        assert_eq!(subnets, vec!["192.168.2.0/24", "192.168.3.0/24"]);
    }

    #[test]
    fn test_replace_credentials_preserves_identity() {
        let registry = test_registry();
        let node = registry.insert(&draft("laptop", "10.12.0.2")).unwrap();

        let rotated = draft("laptop", "10.12.0.3");
        registry.replace_credentials(node.id, &rotated).unwrap();

        let fetched = registry.get_required(node.id).unwrap();
        assert_eq!(fetched.id, node.id);
        assert_eq!(fetched.address, "10.12.0.3");
        assert_ne!(fetched.public_key, node.public_key);
    }

    #[test]
    fn test_delete_cascades_networks() {
        let registry = test_registry();
        let mut node = registry.insert(&draft("gw", "10.12.0.2")).unwrap();
        node.is_gateway = true;
        node.gateway_networks = vec![GatewayNetwork::new("192.168.1.0/24")];
        registry.update(&node).unwrap();

        registry.delete(node.id).unwrap();
        assert!(registry.get(node.id).unwrap().is_none());

        let conn = registry.database().connection();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM gateway_networks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let registry = test_registry();
        let err = registry.delete(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
