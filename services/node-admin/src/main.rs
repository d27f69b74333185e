//! hostfleet Node Admin
//!
//! Runs on each container host. Polls the node repository for desired node
//! state, converges the host's containers to match, and coordinates
//! fleet-wide suspend/resume with the orchestrator.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Mutex};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostfleet_node_admin::agent::NodeAgentContext;
use hostfleet_node_admin::admin::NodeAdmin;
use hostfleet_node_admin::config::Config;
use hostfleet_node_admin::engine::MockEngine;
use hostfleet_node_admin::noderepo::NodeRepositoryClient;
use hostfleet_node_admin::orchestrator::OrchestratorClient;
use hostfleet_node_admin::updater::NodeAdminStateUpdater;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostfleet node admin");

    let config = Config::from_env()?;
    info!(
        base_hostname = %config.base_hostname,
        node_repository_url = %config.node_repository_url,
        orchestrator_url = %config.orchestrator_url,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire up collaborators (engine is mock until a real one is configured)
    let engine = Arc::new(MockEngine::new());
    let node_repo = Arc::new(NodeRepositoryClient::new(&config)?);
    let orchestrator = Arc::new(OrchestratorClient::new(&config)?);

    let ctx = NodeAgentContext {
        engine,
        node_repo: node_repo.clone(),
        orchestrator: orchestrator.clone(),
        node_ctl_path: config.node_ctl_path.clone(),
    };

    let admin = Arc::new(Mutex::new(NodeAdmin::new(ctx, config.image_gc_grace)));

    let updater = Arc::new(NodeAdminStateUpdater::new(
        Arc::clone(&admin),
        node_repo,
        orchestrator,
        config.base_hostname.clone(),
        config.reconcile_interval,
    ));

    let updater_handle = tokio::spawn({
        let updater = Arc::clone(&updater);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            updater.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = updater_handle => {
            info!("Fleet reconciler exited");
        }
    }

    // Signal shutdown and stop every agent before exiting
    let _ = shutdown_tx.send(true);
    admin.lock().await.stop_all().await;

    info!("Node admin shutdown complete");
    Ok(())
}
