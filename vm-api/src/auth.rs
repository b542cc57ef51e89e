use crate::error::ApiError;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use vm_orchestrator::{OrchestratorError, VmOrchestrator, VmRecord};

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub username: String,
    pub email: Option<String>,
}

/// Auth middleware - extracts the user set by the auth proxy in front of vm-api.
///
/// Falls back to the `x-user` header for local development.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let username = req
        .headers()
        .get("x-vm-user")
        .or_else(|| req.headers().get("x-forwarded-user"))
        .or_else(|| req.headers().get("x-user"))
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let email = req
        .headers()
        .get("x-vm-email")
        .or_else(|| req.headers().get("x-forwarded-email"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let username = username.ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut()
        .insert(AuthenticatedUser { username, email });

    Ok(next.run(req).await)
}

/// Load the VM and make sure `user` owns it.
pub async fn owned_vm(
    orchestrator: &VmOrchestrator,
    vm_id: &str,
    user: &AuthenticatedUser,
) -> Result<VmRecord, ApiError> {
    let vm = orchestrator.get_vm(vm_id).await.map_err(|e| match e {
        OrchestratorError::NotFound(_) => ApiError::NotFound(format!("VM not found: {}", vm_id)),
        other => other.into(),
    })?;

    if vm.owner != user.username {
        return Err(ApiError::Forbidden(format!(
            "Access denied: VM {} is owned by {}",
            vm_id, vm.owner
        )));
    }

    Ok(vm)
}
