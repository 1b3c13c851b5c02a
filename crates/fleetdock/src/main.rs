mod services;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use fd_api::state::ApiState;
use fd_auth::AuthService;
use fd_common::config::EnvConfig;
use fd_docker::staleness::DEFAULT_REFRESH_INTERVAL;
use fd_docker::{
    ComposeRunner, DockerEngine, DockerImageSource, DockerTaskHandler, RegistryClient,
    StalenessCache,
};
use fd_registry::{DispatchTimeouts, Dispatcher, NodeRegistry, NodeStore, TaskTable};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = EnvConfig::load(None);
    fd_common::logging::init(env.log_level.as_deref(), "info,fleetdock=debug");

    info!("Fleetdock server starting...");

    if let Some(parent) = env.nodes_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let env = Arc::new(env);

    let store = Arc::new(NodeStore::new(env.nodes_file.clone()));
    let registry = Arc::new(NodeRegistry::with_liveness_window(env.keepalive_window));
    let tasks = TaskTable::new(registry);

    // Node 1 runs its tasks in-process against the local engine.
    let engine = DockerEngine::connect_local().context("Failed to set up Docker engine client")?;
    let stale = StalenessCache::new();
    let local = Arc::new(DockerTaskHandler::new(
        engine.clone(),
        ComposeRunner::default(),
        stale.clone(),
    ));
    let timeouts = DispatchTimeouts {
        reply: env.task_timeout,
        stream: env.stream_timeout,
    };
    let dispatcher = Dispatcher::new(tasks.clone(), local, timeouts);
    info!(
        "Task timeouts: {}s reply, {}s stream",
        timeouts.reply.as_secs(),
        timeouts.stream.as_secs()
    );

    if env.staleness_check {
        let source = Arc::new(DockerImageSource::new(engine, RegistryClient::new()));
        services::spawn_staleness_refresher(source, stale, DEFAULT_REFRESH_INTERVAL);
    } else {
        info!("Staleness check disabled");
    }

    services::spawn_task_sweeper(tasks.clone(), env.sweep_interval);

    let auth = AuthService::new(&env.data_path).context("Failed to open auth store")?;
    auth.start_cleanup_task();
    if auth.users.count() == 0 {
        info!("No administrator account yet; create one with POST /api/v1/users");
    }

    let state = ApiState::new(env.clone(), store, dispatcher, auth);
    let router = fd_api::build_router(state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, env.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("API and agent endpoint listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
