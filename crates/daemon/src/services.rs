//! Published service registries (HTTP and TCP).
//!
//! Maintain the set of backend services bound to nodes, validate
//! uniqueness and backend targets, and drive proxy rebuilds on every
//! change. Mutations are full rebuilds, not incremental diffs: service
//! counts are small relative to reconfiguration cost.

use crate::domains::DomainRegistrar;
use crate::proxy::ProxyConfigurator;
use crate::registry::NodeRegistry;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use wiregate_common::{
    validate, BackendProto, Database, Error, FieldError, HttpService, Proto, Result, TcpService,
};

// ============================================================================
// Request parameters
// ============================================================================

/// Parameters for creating or updating an HTTP service.
#[derive(Debug, Clone)]
pub struct HttpServiceParams {
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
}

impl Default for HttpServiceParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            domain: String::new(),
            backend_proto: BackendProto::Http,
            backend_host: None,
            backend_port: 80,
            ssl: false,
            allowed_ips: Vec::new(),
            blocked_ips: Vec::new(),
            enabled: true,
            ttl: None,
        }
    }
}

/// Parameters for creating or updating a TCP/UDP service.
#[derive(Debug, Clone)]
pub struct TcpServiceParams {
    pub name: String,
    pub proto: Proto,
    pub port: u16,
    pub backend_host: Option<String>,
    pub backend_port: u16,
    pub allowed_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub enabled: bool,
    pub ttl: Option<String>,
}

impl Default for TcpServiceParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            proto: Proto::Tcp,
            port: 0,
            backend_host: None,
            backend_port: 0,
            allowed_ips: Vec::new(),
            blocked_ips: Vec::new(),
            enabled: true,
            ttl: None,
        }
    }
}

// ============================================================================
// Repositories
// ============================================================================

/// Repository over the `http_services` table.
#[derive(Clone)]
pub struct HttpServiceRepo {
    db: Database,
}

impl HttpServiceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, svc: &HttpService) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO http_services (id, node_id, name, domain, backend_proto, backend_host,
                                        backend_port, ssl, allowed_ips, blocked_ips, enabled,
                                        ttl, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                svc.id.to_string(),
                svc.node_id.to_string(),
                svc.name,
                svc.domain,
                svc.backend_proto.to_string(),
                svc.backend_host,
                svc.backend_port,
                svc.ssl,
                serde_json::to_string(&svc.allowed_ips)?,
                serde_json::to_string(&svc.blocked_ips)?,
                svc.enabled,
                svc.ttl,
                svc.expires_at,
                svc.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn update(&self, svc: &HttpService) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE http_services SET name = ?2, domain = ?3, backend_proto = ?4,
                    backend_host = ?5, backend_port = ?6, ssl = ?7, allowed_ips = ?8,
                    blocked_ips = ?9, enabled = ?10, ttl = ?11, expires_at = ?12
             WHERE id = ?1",
            params![
                svc.id.to_string(),
                svc.name,
                svc.domain,
                svc.backend_proto.to_string(),
                svc.backend_host,
                svc.backend_port,
                svc.ssl,
                serde_json::to_string(&svc.allowed_ips)?,
                serde_json::to_string(&svc.blocked_ips)?,
                svc.enabled,
                svc.ttl,
                svc.expires_at,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("http service", svc.id));
        }
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "DELETE FROM http_services WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("http service", id));
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<HttpService>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM http_services WHERE id = ?1", HTTP_COLUMNS),
            params![id.to_string()],
            row_to_http,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list(&self) -> Result<Vec<HttpService>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM http_services ORDER BY domain",
            HTTP_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_http)?;
        collect(rows)
    }

    /// Services the proxy should currently serve: enabled, unexpired,
    /// and owned by an enabled node. Paired with the resolved backend
    /// host (the node's tunnel address when the service declares none).
    pub fn list_active(&self, now: i64) -> Result<Vec<(HttpService, String)>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, COALESCE(s.backend_host, n.address)
             FROM http_services s JOIN nodes n ON n.id = s.node_id
             WHERE s.enabled = 1 AND n.enabled = 1
               AND (s.expires_at IS NULL OR s.expires_at > ?1)
             ORDER BY s.domain",
            HTTP_COLUMNS_QUALIFIED
        ))?;
        let rows = stmt.query_map(params![now], |row| {
            Ok((row_to_http(row)?, row.get::<_, String>(14)?))
        })?;
        collect(rows)
    }

    /// Whether an enabled service already claims `domain`.
    pub fn domain_in_use(&self, domain: &str, exclude: Option<Uuid>) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM http_services
             WHERE domain = ?1 AND enabled = 1 AND id != COALESCE(?2, '')",
            params![domain, exclude.map(|u| u.to_string())],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Enabled services whose expiry has passed.
    pub fn list_expired(&self, now: i64) -> Result<Vec<HttpService>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM http_services
             WHERE enabled = 1 AND expires_at IS NOT NULL AND expires_at <= ?1",
            HTTP_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now], row_to_http)?;
        collect(rows)
    }

    pub fn disable(&self, id: Uuid) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE http_services SET enabled = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

/// Repository over the `tcp_services` table.
#[derive(Clone)]
pub struct TcpServiceRepo {
    db: Database,
}

impl TcpServiceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, svc: &TcpService) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO tcp_services (id, node_id, name, proto, port, backend_host,
                                       backend_port, allowed_ips, blocked_ips, enabled,
                                       ttl, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                svc.id.to_string(),
                svc.node_id.to_string(),
                svc.name,
                svc.proto.to_string(),
                svc.port,
                svc.backend_host,
                svc.backend_port,
                serde_json::to_string(&svc.allowed_ips)?,
                serde_json::to_string(&svc.blocked_ips)?,
                svc.enabled,
                svc.ttl,
                svc.expires_at,
                svc.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn update(&self, svc: &TcpService) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE tcp_services SET name = ?2, proto = ?3, port = ?4, backend_host = ?5,
                    backend_port = ?6, allowed_ips = ?7, blocked_ips = ?8, enabled = ?9,
                    ttl = ?10, expires_at = ?11
             WHERE id = ?1",
            params![
                svc.id.to_string(),
                svc.name,
                svc.proto.to_string(),
                svc.port,
                svc.backend_host,
                svc.backend_port,
                serde_json::to_string(&svc.allowed_ips)?,
                serde_json::to_string(&svc.blocked_ips)?,
                svc.enabled,
                svc.ttl,
                svc.expires_at,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("tcp service", svc.id));
        }
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "DELETE FROM tcp_services WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("tcp service", id));
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<TcpService>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM tcp_services WHERE id = ?1", TCP_COLUMNS),
            params![id.to_string()],
            row_to_tcp,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list(&self) -> Result<Vec<TcpService>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tcp_services ORDER BY port",
            TCP_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_tcp)?;
        collect(rows)
    }

    pub fn list_active(&self, now: i64) -> Result<Vec<(TcpService, String)>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, COALESCE(s.backend_host, n.address)
             FROM tcp_services s JOIN nodes n ON n.id = s.node_id
             WHERE s.enabled = 1 AND n.enabled = 1
               AND (s.expires_at IS NULL OR s.expires_at > ?1)
             ORDER BY s.port",
            TCP_COLUMNS_QUALIFIED
        ))?;
        let rows = stmt.query_map(params![now], |row| {
            Ok((row_to_tcp(row)?, row.get::<_, String>(13)?))
        })?;
        collect(rows)
    }

    /// Whether an enabled service already claims the public `port`.
    pub fn port_in_use(&self, port: u16, exclude: Option<Uuid>) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tcp_services
             WHERE port = ?1 AND enabled = 1 AND id != COALESCE(?2, '')",
            params![port, exclude.map(|u| u.to_string())],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_expired(&self, now: i64) -> Result<Vec<TcpService>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tcp_services
             WHERE enabled = 1 AND expires_at IS NOT NULL AND expires_at <= ?1",
            TCP_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now], row_to_tcp)?;
        collect(rows)
    }

    pub fn disable(&self, id: Uuid) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE tcp_services SET enabled = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

const HTTP_COLUMNS: &str = "id, node_id, name, domain, backend_proto, backend_host, \
                            backend_port, ssl, allowed_ips, blocked_ips, enabled, ttl, \
                            expires_at, created_at";
const HTTP_COLUMNS_QUALIFIED: &str =
    "s.id, s.node_id, s.name, s.domain, s.backend_proto, s.backend_host, s.backend_port, \
     s.ssl, s.allowed_ips, s.blocked_ips, s.enabled, s.ttl, s.expires_at, s.created_at";
const TCP_COLUMNS: &str = "id, node_id, name, proto, port, backend_host, backend_port, \
                           allowed_ips, blocked_ips, enabled, ttl, expires_at, created_at";
const TCP_COLUMNS_QUALIFIED: &str =
    "s.id, s.node_id, s.name, s.proto, s.port, s.backend_host, s.backend_port, \
     s.allowed_ips, s.blocked_ips, s.enabled, s.ttl, s.expires_at, s.created_at";

fn row_to_http(row: &Row) -> rusqlite::Result<HttpService> {
    Ok(HttpService {
        id: parse_uuid(row, 0)?,
        node_id: parse_uuid(row, 1)?,
        name: row.get(2)?,
        domain: row.get(3)?,
        backend_proto: row.get::<_, String>(4)?.parse().unwrap_or_default(),
        backend_host: row.get(5)?,
        backend_port: row.get(6)?,
        ssl: row.get(7)?,
        allowed_ips: parse_json_list(row.get::<_, String>(8)?),
        blocked_ips: parse_json_list(row.get::<_, String>(9)?),
        enabled: row.get(10)?,
        ttl: row.get(11)?,
        expires_at: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn row_to_tcp(row: &Row) -> rusqlite::Result<TcpService> {
    Ok(TcpService {
        id: parse_uuid(row, 0)?,
        node_id: parse_uuid(row, 1)?,
        name: row.get(2)?,
        proto: row.get::<_, String>(3)?.parse().unwrap_or_default(),
        port: row.get(4)?,
        backend_host: row.get(5)?,
        backend_port: row.get(6)?,
        allowed_ips: parse_json_list(row.get::<_, String>(7)?),
        blocked_ips: parse_json_list(row.get::<_, String>(8)?),
        enabled: row.get(9)?,
        ttl: row.get(10)?,
        expires_at: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn parse_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ============================================================================
// Registries
// ============================================================================

/// HTTP service registry.
pub struct HttpServices {
    repo: HttpServiceRepo,
    registry: NodeRegistry,
    registrar: Arc<dyn DomainRegistrar>,
    proxy: Arc<ProxyConfigurator>,
}

impl HttpServices {
    pub fn new(
        repo: HttpServiceRepo,
        registry: NodeRegistry,
        registrar: Arc<dyn DomainRegistrar>,
        proxy: Arc<ProxyConfigurator>,
    ) -> Self {
        Self {
            repo,
            registry,
            registrar,
            proxy,
        }
    }

    pub fn repo(&self) -> &HttpServiceRepo {
        &self.repo
    }

    /// Load all currently served services and rebuild the proxy once.
    pub async fn initialize(&self) -> Result<()> {
        let active = self.repo.list_active(wiregate_common::now_epoch_secs())?;
        info!("Serving {} HTTP services", active.len());
        self.proxy.reload().await
    }

    pub async fn create(&self, node_id: Uuid, params: HttpServiceParams) -> Result<HttpService> {
        self.registry.get_required(node_id)?;
        let expires_at = self.validate(&params, None)?;
        self.registrar.register_domain(&params.domain).await?;

        let now = wiregate_common::now_epoch_secs();
        let svc = HttpService {
            id: Uuid::new_v4(),
            node_id,
            name: params.name,
            domain: params.domain,
            backend_proto: params.backend_proto,
            backend_host: params.backend_host,
            backend_port: params.backend_port,
            ssl: params.ssl,
            allowed_ips: params.allowed_ips,
            blocked_ips: params.blocked_ips,
            enabled: params.enabled,
            ttl: params.ttl,
            expires_at,
            created_at: now,
        };
        self.repo.insert(&svc)?;

        self.initialize().await?;
        Ok(svc)
    }

    pub async fn update(&self, id: Uuid, params: HttpServiceParams) -> Result<HttpService> {
        let existing = self
            .repo
            .get(id)?
            .ok_or_else(|| Error::not_found("http service", id))?;
        let expires_at = self.validate(&params, Some(id))?;
        self.registrar.register_domain(&params.domain).await?;

        let svc = HttpService {
            id: existing.id,
            node_id: existing.node_id,
            name: params.name,
            domain: params.domain,
            backend_proto: params.backend_proto,
            backend_host: params.backend_host,
            backend_port: params.backend_port,
            ssl: params.ssl,
            allowed_ips: params.allowed_ips,
            blocked_ips: params.blocked_ips,
            enabled: params.enabled,
            ttl: params.ttl,
            expires_at,
            created_at: existing.created_at,
        };
        self.repo.update(&svc)?;

        self.initialize().await?;
        Ok(svc)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.repo
            .get(id)?
            .ok_or_else(|| Error::not_found("http service", id))?;
        self.repo.delete(id)?;
        self.initialize().await
    }

    /// Field checks plus uniqueness; returns the resolved expiry.
    fn validate(&self, params: &HttpServiceParams, exclude: Option<Uuid>) -> Result<Option<i64>> {
        let mut errors = Vec::new();
        if let Some(e) = validate::check_domain(&params.domain) {
            errors.push(e);
        }
        if let Some(e) = validate::check_backend_host(params.backend_host.as_deref()) {
            errors.push(e);
        }
        if let Some(e) = validate::check_ip_list("allowed_ips", &params.allowed_ips) {
            errors.push(e);
        }
        if let Some(e) = validate::check_ip_list("blocked_ips", &params.blocked_ips) {
            errors.push(e);
        }

        let mut expires_at = None;
        if let Some(ttl) = &params.ttl {
            match validate::parse_ttl(ttl) {
                Ok(secs) => expires_at = Some(wiregate_common::now_epoch_secs() + secs),
                Err(e) => errors.push(e),
            }
        }

        if params.enabled && self.repo.domain_in_use(&params.domain, exclude)? {
            errors.push(FieldError::new(
                "domain",
                format!("domain {} already published", params.domain),
            ));
        }

        if errors.is_empty() {
            Ok(expires_at)
        } else {
            Err(Error::Validation(errors))
        }
    }
}

/// TCP/UDP service registry.
pub struct TcpServices {
    repo: TcpServiceRepo,
    registry: NodeRegistry,
    proxy: Arc<ProxyConfigurator>,
    port_range: Option<(u16, u16)>,
}

impl TcpServices {
    pub fn new(
        repo: TcpServiceRepo,
        registry: NodeRegistry,
        proxy: Arc<ProxyConfigurator>,
        port_range: Option<(u16, u16)>,
    ) -> Self {
        Self {
            repo,
            registry,
            proxy,
            port_range,
        }
    }

    pub fn repo(&self) -> &TcpServiceRepo {
        &self.repo
    }

    /// Load all currently served services and rebuild the proxy once.
    pub async fn initialize(&self) -> Result<()> {
        let active = self.repo.list_active(wiregate_common::now_epoch_secs())?;
        info!("Serving {} TCP services", active.len());
        self.proxy.reload().await
    }

    pub async fn create(&self, node_id: Uuid, params: TcpServiceParams) -> Result<TcpService> {
        self.registry.get_required(node_id)?;
        let expires_at = self.validate(&params, None)?;

        let now = wiregate_common::now_epoch_secs();
        let svc = TcpService {
            id: Uuid::new_v4(),
            node_id,
            name: params.name,
            proto: params.proto,
            port: params.port,
            backend_host: params.backend_host,
            backend_port: params.backend_port,
            allowed_ips: params.allowed_ips,
            blocked_ips: params.blocked_ips,
            enabled: params.enabled,
            ttl: params.ttl,
            expires_at,
            created_at: now,
        };
        self.repo.insert(&svc)?;

        self.initialize().await?;
        Ok(svc)
    }

    pub async fn update(&self, id: Uuid, params: TcpServiceParams) -> Result<TcpService> {
        let existing = self
            .repo
            .get(id)?
            .ok_or_else(|| Error::not_found("tcp service", id))?;
        let expires_at = self.validate(&params, Some(id))?;

        let svc = TcpService {
            id: existing.id,
            node_id: existing.node_id,
            name: params.name,
            proto: params.proto,
            port: params.port,
            backend_host: params.backend_host,
            backend_port: params.backend_port,
            allowed_ips: params.allowed_ips,
            blocked_ips: params.blocked_ips,
            enabled: params.enabled,
            ttl: params.ttl,
            expires_at,
            created_at: existing.created_at,
        };
        self.repo.update(&svc)?;

        self.initialize().await?;
        Ok(svc)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.repo
            .get(id)?
            .ok_or_else(|| Error::not_found("tcp service", id))?;
        self.repo.delete(id)?;
        self.initialize().await
    }

    fn validate(&self, params: &TcpServiceParams, exclude: Option<Uuid>) -> Result<Option<i64>> {
        let mut errors = Vec::new();
        if let Some(e) = validate::check_backend_host(params.backend_host.as_deref()) {
            errors.push(e);
        }
        if let Some(e) = validate::check_port_range(params.port, self.port_range) {
            errors.push(e);
        }
        if let Some(e) = validate::check_ip_list("allowed_ips", &params.allowed_ips) {
            errors.push(e);
        }
        if let Some(e) = validate::check_ip_list("blocked_ips", &params.blocked_ips) {
            errors.push(e);
        }

        let mut expires_at = None;
        if let Some(ttl) = &params.ttl {
            match validate::parse_ttl(ttl) {
                Ok(secs) => expires_at = Some(wiregate_common::now_epoch_secs() + secs),
                Err(e) => errors.push(e),
            }
        }

        if params.enabled && self.repo.port_in_use(params.port, exclude)? {
            errors.push(FieldError::new(
                "port",
                format!("port {} already published", params.port),
            ));
        }

        if errors.is_empty() {
            Ok(expires_at)
        } else {
            Err(Error::Validation(errors))
        }
    }
}
