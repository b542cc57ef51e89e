pub mod health;
pub mod runs;
pub mod ssh_keys;
pub mod vms;

use crate::{auth::auth_middleware, state::AppState};
use axum::{middleware, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub async fn create_app(state: AppState) -> anyhow::Result<Router> {
    // Allow CORS for local development (frontend on different port)
    let cors = CorsLayer::permissive();

    let app = Router::new()
        .merge(health::routes()) // Health routes don't need auth
        .merge(
            vms::routes()
                .merge(runs::routes())
                .merge(ssh_keys::routes())
                .layer(middleware::from_fn(auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}
