use crate::{
    auth::{owned_vm, AuthenticatedUser},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashSet;
use vm_orchestrator::{Run, RunDetail, RunStatus, VmFilters};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/runs", get(list_runs))
        .route("/api/v1/runs/{id}", get(get_run))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    vm_id: Option<String>,
    status: Option<String>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<Vec<Run>>> {
    let status = query
        .status
        .map(|s| {
            serde_json::from_str::<RunStatus>(&format!("\"{}\"", s))
                .map_err(|_| ApiError::BadRequest(format!("Unknown run status: {}", s)))
        })
        .transpose()?;

    if let Some(vm_id) = &query.vm_id {
        owned_vm(&state.orchestrator, vm_id, &user).await?;
        let runs = state.orchestrator.list_runs(Some(vm_id), status).await?;
        return Ok(Json(runs));
    }

    let owned: HashSet<String> = state
        .orchestrator
        .list_vms(VmFilters {
            owner: Some(user.username),
            status: None,
        })
        .await?
        .into_iter()
        .map(|vm| vm.id)
        .collect();

    let runs = state
        .orchestrator
        .list_runs(None, status)
        .await?
        .into_iter()
        .filter(|run| owned.contains(&run.vm_id))
        .collect();

    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<RunDetail>> {
    let detail = state.orchestrator.get_run(&id).await?;
    owned_vm(&state.orchestrator, &detail.run.vm_id, &user).await?;
    Ok(Json(detail))
}
