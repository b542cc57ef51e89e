use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use vm_api::{create_app, start_dispatch_task, start_janitor_task, AppState, Config};
use vm_hypervisor::{ClusterConfig, HypervisorClient};
use vm_orchestrator::db::{backup_database, create_pool, run_migrations};
use vm_orchestrator::{Dispatcher, EngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = vm_logging::init_subscriber();

    info!("Starting vm-api service...");

    // Load configuration
    let config = Config::from_env();
    let cluster = ClusterConfig::from_env();
    let engine = EngineConfig::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, cluster={} (node {})",
        config.bind_addr,
        config.db_path.display(),
        cluster.api_url,
        cluster.node
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let gateway = Arc::new(HypervisorClient::new(cluster)?);
    let max_remote_calls = engine.max_remote_calls;
    let state = AppState::new(pool, gateway, engine);

    // Dispatcher plus the task that feeds it pending runs
    let dispatcher = Arc::new(Dispatcher::start(state.orchestrator.sequencer()));
    tokio::spawn(start_dispatch_task(
        dispatcher.clone(),
        config.dispatch_interval_secs,
    ));
    info!(
        "Dispatch task started (max {} remote calls, interval: {}s)",
        max_remote_calls, config.dispatch_interval_secs
    );

    tokio::spawn(start_janitor_task(
        state.orchestrator.clone(),
        config.janitor_interval_secs,
    ));
    info!(
        "Janitor task started (interval: {}s)",
        config.janitor_interval_secs
    );

    let app = create_app(state).await?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
