use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use vm_orchestrator::RunStatus;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "vm-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready once the database answers. Reports the run backlog alongside.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = sqlx::query("SELECT 1")
        .fetch_one(state.orchestrator.pool())
        .await
        .is_ok();

    let (pending, running) = if db_ok {
        let count = |status| {
            let orchestrator = state.orchestrator.clone();
            async move {
                orchestrator
                    .list_runs(None, Some(status))
                    .await
                    .map(|runs| runs.len())
                    .unwrap_or_default()
            }
        };
        (count(RunStatus::Pending).await, count(RunStatus::Running).await)
    } else {
        (0, 0)
    };

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_ok { "ready" } else { "not_ready" },
            "service": "vm-api",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "connected" } else { "disconnected" },
            "runs": { "pending": pending, "running": running }
        })),
    )
}
