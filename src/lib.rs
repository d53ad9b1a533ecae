pub mod config;
pub mod error;
pub mod page;
pub mod runs;
pub mod state;
pub mod storage;
pub mod triggers;
pub mod workflow;

use crate::error::Result;
use crate::page::bridge::connect_bridge;
use crate::state::EngineState;
use crate::storage::FileStorage;
use crate::workflow::WorkflowManager;
use std::sync::Arc;
use std::time::Duration;

/// Start the engine: hydrate workflows, connect the page bridge, arm
/// triggers, and run until interrupted.
pub async fn run() -> Result<()> {
    // Load configuration (never overwrite existing file on failure)
    let config = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}. Using in-memory defaults (not saving).", e);
            config::AppConfig::default()
        }
    };

    let storage = Arc::new(FileStorage::new(config.state_path())?);
    let manager = Arc::new(WorkflowManager::new(storage));
    tracing::info!(workflows = manager.list().len(), "workflow state loaded");

    let page = connect_bridge(
        &config.bridge_endpoint,
        Duration::from_millis(config.engine.rpc_timeout_ms),
    )
    .await
    .map_err(|e| crate::error::TabflowError::Config(e.to_string()))?;
    tracing::info!(endpoint = %config.bridge_endpoint, "page bridge connected");

    let state = EngineState::new(config, manager, page);

    let trigger_engine = state.triggers.clone();
    let engine_task = tokio::spawn(async move {
        trigger_engine.run().await;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    engine_task.abort();
    state.shutdown();
    Ok(())
}
