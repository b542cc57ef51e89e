use crate::{
    auth::{owned_vm, AuthenticatedUser},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use vm_hypervisor::PowerAction;
use vm_orchestrator::{
    CreateVmRequest, ProgressSnapshot, RebuildRequest, ResourceSpec, Run, VmFilters, VmRecord,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/vms", get(list_vms).post(create_vm))
        .route("/api/v1/vms/{id}", get(get_vm).delete(delete_vm))
        .route("/api/v1/vms/{id}/rebuild", post(rebuild_vm))
        .route("/api/v1/vms/{id}/resize", post(resize_vm))
        .route("/api/v1/vms/{id}/power/{action}", post(power_vm))
        .route("/api/v1/vms/{id}/progress", get(get_progress))
}

#[derive(Debug, Serialize)]
struct CreatedVm {
    vm: VmRecord,
    run: Run,
}

async fn create_vm(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Json(mut req): Json<CreateVmRequest>,
) -> ApiResult<(StatusCode, Json<CreatedVm>)> {
    // Override owner with authenticated user
    req.owner = user.username;

    let (vm, run) = state.orchestrator.create_vm(req).await?;

    Ok((StatusCode::ACCEPTED, Json(CreatedVm { vm, run })))
}

async fn list_vms(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<Vec<VmRecord>>> {
    let filters = VmFilters {
        owner: Some(user.username),
        status: None,
    };

    let vms = state.orchestrator.list_vms(filters).await?;

    Ok(Json(vms))
}

async fn get_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<VmRecord>> {
    let vm = owned_vm(&state.orchestrator, &id, &user).await?;
    Ok(Json(vm))
}

async fn delete_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    owned_vm(&state.orchestrator, &id, &user).await?;
    let run = state.orchestrator.delete(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn rebuild_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Json(req): Json<RebuildRequest>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    owned_vm(&state.orchestrator, &id, &user).await?;
    let run = state.orchestrator.rebuild(&id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn resize_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Json(target): Json<ResourceSpec>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    owned_vm(&state.orchestrator, &id, &user).await?;
    let run = state.orchestrator.resize(&id, target).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn power_vm(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<VmRecord>> {
    let action: PowerAction = action.parse().map_err(ApiError::BadRequest)?;
    owned_vm(&state.orchestrator, &id, &user).await?;

    let vm = state
        .orchestrator
        .power(&id, &user.username, action)
        .await?;
    Ok(Json(vm))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<ProgressSnapshot>> {
    owned_vm(&state.orchestrator, &id, &user).await?;
    let progress = state
        .orchestrator
        .progress(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No runs recorded for VM {}", id)))?;
    Ok(Json(progress))
}
