pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod janitor;
pub mod routes;
pub mod state;

pub use config::Config;
pub use dispatch::start_dispatch_task;
pub use error::{ApiError, ApiResult};
pub use janitor::start_janitor_task;
pub use routes::create_app;
pub use state::AppState;
