use crate::{auth::AuthenticatedUser, error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use vm_orchestrator::SshKey;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/ssh-keys", get(list_keys).post(add_key))
        .route("/api/v1/ssh-keys/{id}", delete(delete_key))
}

#[derive(Debug, Deserialize)]
struct AddKeyRequest {
    name: String,
    public_key: String,
}

async fn add_key(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Json(req): Json<AddKeyRequest>,
) -> ApiResult<(StatusCode, Json<SshKey>)> {
    let key = state
        .orchestrator
        .add_ssh_key(&user.username, &req.name, &req.public_key)
        .await?;
    Ok((StatusCode::CREATED, Json(key)))
}

async fn list_keys(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<Vec<SshKey>>> {
    let keys = state.orchestrator.list_ssh_keys(&user.username).await?;
    Ok(Json(keys))
}

async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .delete_ssh_key(&user.username, &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
