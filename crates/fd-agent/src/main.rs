mod config;
mod error;
mod session;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use fd_docker::staleness::DEFAULT_REFRESH_INTERVAL;
use fd_docker::{
    ComposeRunner, DockerEngine, DockerImageSource, DockerTaskHandler, RegistryClient,
    StalenessCache,
};
use fd_protocol::Keepalive;
use tracing::{error, info};

use crate::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use crate::session::{AgentSession, CloseReason, SessionSettings, WsConnector};

#[tokio::main]
async fn main() -> Result<()> {
    let explicit_path = std::env::args().nth(1);
    let path = explicit_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let cfg = AgentConfig::load(path, explicit_path.is_some())?;

    fd_common::logging::init(cfg.log_level.as_deref(), "info,fd_agent=debug");

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let agent_version = config::agent_version();
    info!(version = %agent_version, "Fleetdock agent starting...");

    let url = cfg.ws_url().context("Invalid SERVER_URL")?;

    let engine = DockerEngine::connect_local().context("Failed to set up Docker engine client")?;
    let stale = StalenessCache::new();
    if cfg.staleness_check {
        let source = Arc::new(DockerImageSource::new(engine.clone(), RegistryClient::new()));
        tokio::spawn(fd_docker::run_refresher(
            source,
            stale.clone(),
            DEFAULT_REFRESH_INTERVAL,
        ));
    } else {
        info!("Staleness check disabled");
    }

    let handler = Arc::new(DockerTaskHandler::new(engine, ComposeRunner::default(), stale));
    let settings = SessionSettings {
        url,
        token: cfg.token.clone(),
        agent_version,
        agent_arch: config::agent_arch().to_string(),
        keepalive: Keepalive::new(cfg.keepalive_window()),
        workers: cfg.workers,
        queue_capacity: cfg.queue_capacity,
    };
    info!(
        workers = settings.workers,
        queue = settings.queue_capacity,
        "Config loaded"
    );

    let mut session = AgentSession::new(settings, WsConnector, handler);
    let result = session.run(shutdown_signal()).await;
    info!("Session ended: {:?}", session.state());
    match result {
        Ok(CloseReason::Shutdown) => {
            info!("Agent stopped");
            Ok(())
        }
        Ok(reason) => {
            error!("Connection closed: {reason:?}");
            anyhow::bail!("session closed: {reason:?}")
        }
        Err(e) => {
            error!("Session failed: {e}");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
