//! Wiregate Daemon
//!
//! Self-hosted VPN gateway controller: registers WireGuard peers,
//! reconciles tunnel and route state, and publishes node services
//! through a reverse proxy.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wiregate_daemon::config::DaemonConfig;
use wiregate_daemon::domains::LocalRegistrar;
use wiregate_daemon::expiry::ExpirySweeper;
use wiregate_daemon::netlink::IpRoute;
use wiregate_daemon::orchestrator::NodeOrchestrator;
use wiregate_daemon::proxy::{NginxRunner, ProxyConfigurator};
use wiregate_daemon::registry::NodeRegistry;
use wiregate_daemon::services::{HttpServiceRepo, HttpServices, TcpServiceRepo, TcpServices};
use wiregate_daemon::startup::StartupSequencer;
use wiregate_daemon::tokens::TokenIssuer;
use wiregate_daemon::wg::{WgCli, WgEngine};

#[derive(Parser)]
#[command(name = "wiregated")]
#[command(about = "Wiregate daemon - WireGuard VPN gateway controller")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.wiregate/config.toml")]
    config: PathBuf,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Name of the controller's own node record
    #[arg(long, default_value = "controller")]
    local_name: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Wiregate daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    tokio::fs::create_dir_all(&config.store_path).await?;

    let db = wiregate_common::Database::open(&config.db_path())?;
    let registry = NodeRegistry::new(db.clone());
    registry.init_schema()?;

    let engine = Arc::new(WgEngine::new(
        config.wg.clone(),
        config.wg_dir(),
        registry.clone(),
        Arc::new(WgCli::new(config.wg_dir())),
    )?);

    let http_repo = HttpServiceRepo::new(db.clone());
    let tcp_repo = TcpServiceRepo::new(db.clone());
    let proxy = Arc::new(ProxyConfigurator::new(
        http_repo.clone(),
        tcp_repo.clone(),
        Arc::new(NginxRunner::new(
            config.proxy.http_config_path.clone(),
            config.proxy.stream_config_path.clone(),
        )),
    ));

    let registrar = Arc::new(LocalRegistrar);
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
        config.proxy.exposable_range(),
    ));

    let orchestrator = Arc::new(NodeOrchestrator::new(
        registry,
        engine,
        Arc::new(IpRoute),
        TokenIssuer::new(db),
        http,
        tcp,
    ));

    let sequencer = StartupSequencer::new(
        orchestrator.clone(),
        registrar,
        http_repo.clone(),
        tcp_repo.clone(),
        proxy.clone(),
    );
    sequencer.run(&cli.local_name).await;

    let sweeper = ExpirySweeper::new(http_repo, tcp_repo, proxy);
    let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

    info!("Daemon started, store at {}", config.store_path.display());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = sweeper_handle => {
            if let Err(e) = result {
                tracing::error!("Expiry sweeper error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
