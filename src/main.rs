use std::path::PathBuf;
use std::sync::Arc;

use weft_runtime::runner::EchoRunner;
use weft_runtime::workflows;
use weft_runtime::{
    AgentRegistry, DispatcherConfig, Engine, EngineConfig, EventBus, OrchestrationRegistry,
    SessionDispatcher,
};
use weft_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("starting weft");

    // Database path
    let data_dir = dirs_home().join(".weft");
    let db_path = data_dir.join("weft.db");
    let db = Database::open(&db_path)?;

    // Registries are built once here and handed to the runtime by reference
    let mut agents = AgentRegistry::new();
    for name in workflows::SAMPLE_AGENTS {
        agents.register(*name, Arc::new(EchoRunner));
    }

    let mut orchestrations = OrchestrationRegistry::new();
    workflows::register_samples(&mut orchestrations);

    tracing::info!(
        agents = ?agents.names(),
        orchestrations = ?orchestrations.names(),
        "registries ready"
    );

    let dispatcher = Arc::new(SessionDispatcher::new(
        Arc::new(agents),
        db.clone(),
        DispatcherConfig::default(),
    ));
    let engine = Arc::new(Engine::start(
        db.clone(),
        Arc::new(orchestrations),
        Arc::clone(&dispatcher),
        EngineConfig::default(),
    ));

    // Re-drive anything left open by a previous run
    engine.resume().await?;

    let bus = Arc::new(EventBus::new(db, engine.sender()));

    // Start server
    let config = weft_server::ServerConfig::default();
    let state = weft_server::AppState {
        dispatcher,
        engine,
        bus,
    };
    let handle = weft_server::start(config, state).await?;

    tracing::info!(port = handle.port, "weft ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
