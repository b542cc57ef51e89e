use sqlx::SqlitePool;
use std::sync::Arc;
use vm_hypervisor::Gateway;
use vm_orchestrator::{EngineConfig, VmOrchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: VmOrchestrator,
}

impl AppState {
    pub fn new(pool: SqlitePool, gateway: Arc<dyn Gateway>, engine: EngineConfig) -> Self {
        Self {
            orchestrator: VmOrchestrator::new(pool, gateway, engine),
        }
    }
}
