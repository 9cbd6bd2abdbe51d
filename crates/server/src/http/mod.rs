use axum::{Router, middleware::from_fn_with_state, routing::get, routing::post};

use crate::{AppState, routes};

mod auth;

pub use auth::require_sync_token;

pub fn router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/sync", post(routes::sync::receive_sync))
        .layer(from_fn_with_state(state.clone(), auth::require_sync_token));

    Router::new()
        .route("/health", get(routes::health::health_check))
        .merge(sync_routes)
        .with_state(state)
}
