//! Shared in-memory harness for end-to-end controller tests.
//!
//! Wires the full stack (registry, engine, orchestrator, service
//! registries, sweeper) against fake tunnel/route/proxy backends so
//! tests can drive real operation sequences and observe the resulting
//! route table and rendered proxy configuration.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiregate_common::{Database, Result};
use wiregate_daemon::config::WgConfig;
use wiregate_daemon::domains::LocalRegistrar;
use wiregate_daemon::expiry::ExpirySweeper;
use wiregate_daemon::netlink::RouteSync;
use wiregate_daemon::orchestrator::NodeOrchestrator;
use wiregate_daemon::proxy::{ProxyConfigurator, ProxyRunner};
use wiregate_daemon::registry::NodeRegistry;
use wiregate_daemon::services::{HttpServiceRepo, HttpServices, TcpServiceRepo, TcpServices};
use wiregate_daemon::tokens::TokenIssuer;
use wiregate_daemon::wg::{TunnelControl, WgEngine};

/// In-memory route table keyed by (subnet, next hop).
#[derive(Default)]
pub struct FakeRoutes {
    table: Mutex<BTreeSet<(String, String)>>,
}

impl FakeRoutes {
    pub fn entries(&self) -> Vec<(String, String)> {
        self.table.lock().iter().cloned().collect()
    }

    pub fn subnets(&self) -> Vec<String> {
        self.table.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    /// Simulate a host reboot losing all routes.
    pub fn clear(&self) {
        self.table.lock().clear();
    }
}

#[async_trait]
impl RouteSync for FakeRoutes {
    async fn add_route(&self, subnet: &str, next_hop: &str, _iface: &str) -> Result<()> {
        self.table
            .lock()
            .insert((subnet.to_string(), next_hop.to_string()));
        Ok(())
    }

    async fn del_route(&self, subnet: &str, next_hop: &str) -> Result<()> {
        self.table
            .lock()
            .remove(&(subnet.to_string(), next_hop.to_string()));
        Ok(())
    }
}

/// Tunnel backend that accepts everything and reports nothing live.
pub struct NullTunnel;

#[async_trait]
impl TunnelControl for NullTunnel {
    async fn apply(&self, _interface: &str, _config: &str) -> Result<()> {
        Ok(())
    }

    async fn dump(&self, _interface: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn probe(&self, _address: &str) -> Option<f64> {
        None
    }
}

/// Captures rendered proxy configuration instead of touching nginx.
#[derive(Default)]
pub struct RecordingRunner {
    pub http_conf: Mutex<String>,
    pub stream_conf: Mutex<String>,
    pub reloads: AtomicUsize,
}

impl RecordingRunner {
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyRunner for RecordingRunner {
    async fn write_config(&self, http_conf: &str, stream_conf: &str) -> Result<()> {
        *self.http_conf.lock() = http_conf.to_string();
        *self.stream_conf.lock() = stream_conf.to_string();
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The assembled controller under test.
pub struct Controller {
    pub orchestrator: Arc<NodeOrchestrator>,
    pub http: Arc<HttpServices>,
    pub tcp: Arc<TcpServices>,
    pub http_repo: HttpServiceRepo,
    pub tcp_repo: TcpServiceRepo,
    pub tokens: TokenIssuer,
    pub routes: Arc<FakeRoutes>,
    pub runner: Arc<RecordingRunner>,
    pub sweeper: ExpirySweeper,
    _store: tempfile::TempDir,
}

/// Build a full controller over fakes, with the given tunnel subnet.
pub fn controller_with_subnet(subnet: &str) -> Controller {
    let db = Database::open_memory().unwrap();
    let registry = NodeRegistry::new(db.clone());
    registry.init_schema().unwrap();

    let store = tempfile::tempdir().unwrap();
    let mut wg = WgConfig::default();
    wg.interfaces[0].subnet = subnet.to_string();
    let engine = Arc::new(
        WgEngine::new(
            wg,
            store.path().to_path_buf(),
            registry.clone(),
            Arc::new(NullTunnel),
        )
        .unwrap(),
    );

    let http_repo = HttpServiceRepo::new(db.clone());
    let tcp_repo = TcpServiceRepo::new(db.clone());
    let runner = Arc::new(RecordingRunner::default());
    let proxy = Arc::new(ProxyConfigurator::new(
        http_repo.clone(),
        tcp_repo.clone(),
        runner.clone(),
    ));

    let http = Arc::new(HttpServices::new(
        http_repo.clone(),
        registry.clone(),
        Arc::new(LocalRegistrar),
        proxy.clone(),
    ));
    let tcp = Arc::new(TcpServices::new(
        tcp_repo.clone(),
        registry.clone(),
        proxy.clone(),
        Some((9000, 9999)),
    ));

    let routes = Arc::new(FakeRoutes::default());
    let tokens = TokenIssuer::new(db);
    let orchestrator = Arc::new(NodeOrchestrator::new(
        registry,
        engine,
        routes.clone(),
        tokens.clone(),
        http.clone(),
        tcp.clone(),
    ));

    let sweeper = ExpirySweeper::new(http_repo.clone(), tcp_repo.clone(), proxy);

    Controller {
        orchestrator,
        http,
        tcp,
        http_repo,
        tcp_repo,
        tokens,
        routes,
        runner,
        sweeper,
        _store: store,
    }
}

pub fn controller() -> Controller {
    controller_with_subnet("10.8.0.0/24")
}
