//! Startup sequencer.
//!
//! Brings the controller's subsystems up at process start. Each
//! initialization is isolated: a failure is logged and the remaining
//! subsystems still come up, so one broken collaborator (say, an
//! unreachable registrar) cannot keep the tunnel down. The proxy is
//! reloaded exactly once at the end, regardless of how many
//! initializations succeeded.

use crate::domains::DomainRegistrar;
use crate::orchestrator::NodeOrchestrator;
use crate::proxy::ProxyConfigurator;
use crate::services::{HttpServiceRepo, TcpServiceRepo};
use std::sync::Arc;
use tracing::{error, info};

pub struct StartupSequencer {
    orchestrator: Arc<NodeOrchestrator>,
    registrar: Arc<dyn DomainRegistrar>,
    http_repo: HttpServiceRepo,
    tcp_repo: TcpServiceRepo,
    proxy: Arc<ProxyConfigurator>,
}

impl StartupSequencer {
    pub fn new(
        orchestrator: Arc<NodeOrchestrator>,
        registrar: Arc<dyn DomainRegistrar>,
        http_repo: HttpServiceRepo,
        tcp_repo: TcpServiceRepo,
        proxy: Arc<ProxyConfigurator>,
    ) -> Self {
        Self {
            orchestrator,
            registrar,
            http_repo,
            tcp_repo,
            proxy,
        }
    }

    /// Run all subsystem initializations, then one proxy reload.
    pub async fn run(&self, local_name: &str) {
        if let Err(e) = self.registrar.initialize().await {
            error!("Domain registrar initialization failed: {}", e);
        }

        // Local node bootstrap, gateway route restore, tunnel apply
        if let Err(e) = self.orchestrator.initialize(local_name).await {
            error!("VPN initialization failed: {}", e);
        }

        let now = wiregate_common::now_epoch_secs();
        match self.http_repo.list_active(now) {
            Ok(active) => info!("Loaded {} HTTP services", active.len()),
            Err(e) => error!("HTTP service load failed: {}", e),
        }
        match self.tcp_repo.list_active(now) {
            Ok(active) => info!("Loaded {} TCP services", active.len()),
            Err(e) => error!("TCP service load failed: {}", e),
        }

        if let Err(e) = self.proxy.reload().await {
            error!("Initial proxy reload failed: {}", e);
        } else {
            info!("Startup sequence complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WgConfig;
    use crate::domains::LocalRegistrar;
    use crate::netlink::RouteSync;
    use crate::proxy::ProxyRunner;
    use crate::registry::NodeRegistry;
    use crate::services::{HttpServices, TcpServices};
    use crate::tokens::TokenIssuer;
    use crate::wg::{TunnelControl, WgEngine};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiregate_common::{Database, Error, Result};

    struct NullTunnel;

    #[async_trait]
    impl TunnelControl for NullTunnel {
        async fn apply(&self, _i: &str, _c: &str) -> Result<()> {
            Ok(())
        }
        async fn dump(&self, _i: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn probe(&self, _a: &str) -> Option<f64> {
            None
        }
    }

    struct NullRoutes;

    #[async_trait]
    impl RouteSync for NullRoutes {
        async fn add_route(&self, _s: &str, _n: &str, _i: &str) -> Result<()> {
            Ok(())
        }
        async fn del_route(&self, _s: &str, _n: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingRunner {
        reloads: AtomicUsize,
    }

    #[async_trait]
    impl ProxyRunner for CountingRunner {
        async fn write_config(&self, _h: &str, _s: &str) -> Result<()> {
            Ok(())
        }
        async fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingRegistrar;

    #[async_trait]
    impl DomainRegistrar for FailingRegistrar {
        async fn initialize(&self) -> Result<()> {
            Err(Error::Internal("registrar down".to_string()))
        }
        async fn register_domain(&self, _domain: &str) -> Result<()> {
            Err(Error::Internal("registrar down".to_string()))
        }
    }

    fn sequencer(registrar: Arc<dyn DomainRegistrar>) -> (StartupSequencer, Arc<CountingRunner>, NodeRegistry) {
        let db = Database::open_memory().unwrap();
        let registry = NodeRegistry::new(db.clone());
        registry.init_schema().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(
            WgEngine::new(
                WgConfig::default(),
                dir.path().to_path_buf(),
                registry.clone(),
                Arc::new(NullTunnel),
            )
            .unwrap(),
        );
        // Key files are only read at construction
        drop(dir);

        let http_repo = crate::services::HttpServiceRepo::new(db.clone());
        let tcp_repo = crate::services::TcpServiceRepo::new(db.clone());
        let runner = Arc::new(CountingRunner::default());
        let proxy = Arc::new(ProxyConfigurator::new(
            http_repo.clone(),
            tcp_repo.clone(),
            runner.clone(),
        ));
        let http = Arc::new(HttpServices::new(
            http_repo.clone(),
            registry.clone(),
            registrar.clone(),
            proxy.clone(),
        ));
        let tcp = Arc::new(TcpServices::new(
            tcp_repo.clone(),
            registry.clone(),
            proxy.clone(),
            None,
        ));

        let orchestrator = Arc::new(crate::orchestrator::NodeOrchestrator::new(
            registry.clone(),
            engine,
            Arc::new(NullRoutes),
            TokenIssuer::new(db),
            http,
            tcp,
        ));

        (
            StartupSequencer::new(orchestrator, registrar, http_repo, tcp_repo, proxy),
            runner,
            registry,
        )
    }

    #[tokio::test]
    async fn test_startup_reloads_proxy_exactly_once() {
        let (seq, runner, registry) = sequencer(Arc::new(LocalRegistrar));
        seq.run("controller").await;

        assert_eq!(runner.reloads.load(Ordering::SeqCst), 1);
        assert!(registry.local_node().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_registrar_failure_does_not_abort_startup() {
        let (seq, runner, registry) = sequencer(Arc::new(FailingRegistrar));
        seq.run("controller").await;

        // The VPN still came up and the proxy still reloaded once
        assert_eq!(runner.reloads.load(Ordering::SeqCst), 1);
        assert!(registry.local_node().unwrap().is_some());
    }
}
