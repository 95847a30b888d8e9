//! Service expiry sweeper.
//!
//! Periodically disables published services whose TTL has elapsed and
//! rebuilds the proxy once per sweep that changed anything. Expired
//! services are disabled, never deleted; their records persist for
//! re-enable.

use crate::proxy::ProxyConfigurator;
use crate::services::{HttpServiceRepo, TcpServiceRepo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use wiregate_common::Result;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct ExpirySweeper {
    http_repo: HttpServiceRepo,
    tcp_repo: TcpServiceRepo,
    proxy: Arc<ProxyConfigurator>,
}

impl ExpirySweeper {
    pub fn new(
        http_repo: HttpServiceRepo,
        tcp_repo: TcpServiceRepo,
        proxy: Arc<ProxyConfigurator>,
    ) -> Self {
        Self {
            http_repo,
            tcp_repo,
            proxy,
        }
    }

    pub async fn run(&self) {
        info!("Expiry sweeper started");
        loop {
            if let Err(e) = self.sweep_once(wiregate_common::now_epoch_secs()).await {
                error!("Expiry sweep failed: {}", e);
            }
            tokio::time::sleep(SWEEP_INTERVAL).await;
        }
    }

    /// One sweep pass; returns how many services were expired.
    pub async fn sweep_once(&self, now: i64) -> Result<usize> {
        let mut expired = 0;

        for svc in self.http_repo.list_expired(now)? {
            info!("HTTP service {} expired, disabling", svc.name);
            self.http_repo.disable(svc.id)?;
            expired += 1;
        }
        for svc in self.tcp_repo.list_expired(now)? {
            info!("TCP service {} expired, disabling", svc.name);
            self.tcp_repo.disable(svc.id)?;
            expired += 1;
        }

        if expired > 0 {
            self.proxy.reload().await?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyRunner;
    use crate::registry::NodeRegistry;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;
    use wiregate_common::{Database, HttpService, NodeDraft};

    #[derive(Default)]
    struct RecordingRunner {
        http_conf: Mutex<String>,
    }

    #[async_trait]
    impl ProxyRunner for RecordingRunner {
        async fn write_config(&self, http_conf: &str, _stream_conf: &str) -> Result<()> {
            *self.http_conf.lock() = http_conf.to_string();
            Ok(())
        }
        async fn reload(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweep_disables_expired_services() {
        let db = Database::open_memory().unwrap();
        let registry = NodeRegistry::new(db.clone());
        registry.init_schema().unwrap();
        let node = registry
            .insert(&NodeDraft {
                name: "laptop".to_string(),
                address: "10.12.0.2".to_string(),
                public_key: Some("pub".to_string()),
                private_key: Some("priv".to_string()),
                wg_interface: "wg0".to_string(),
                is_gateway: false,
                is_local: false,
                allow_internet: false,
                enabled: true,
                gateway_networks: Vec::new(),
            })
            .unwrap();

        let http_repo = HttpServiceRepo::new(db.clone());
        let tcp_repo = TcpServiceRepo::new(db);
        let runner = std::sync::Arc::new(RecordingRunner::default());
        let proxy = Arc::new(ProxyConfigurator::new(
            http_repo.clone(),
            tcp_repo.clone(),
            runner.clone(),
        ));

        let now = wiregate_common::now_epoch_secs();
        http_repo
            .insert(&HttpService {
                id: Uuid::new_v4(),
                node_id: node.id,
                name: "ephemeral".to_string(),
                domain: "tmp.example.com".to_string(),
                backend_proto: Default::default(),
                backend_host: None,
                backend_port: 3000,
                ssl: false,
                allowed_ips: Vec::new(),
                blocked_ips: Vec::new(),
                enabled: true,
                ttl: Some("45s".to_string()),
                expires_at: Some(now - 10),
                created_at: now - 60,
            })
            .unwrap();

        let sweeper = ExpirySweeper::new(http_repo.clone(), tcp_repo, proxy);
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 1);
        assert!(!runner.http_conf.lock().contains("tmp.example.com"));

        // Record persists, only disabled
        let all = http_repo.list().unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].enabled);

        // Second sweep finds nothing
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 0);
    }
}
