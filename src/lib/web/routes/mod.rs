pub mod v1;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::*;

use crate::web::{ApiError, AppState};

#[instrument(level = "trace", skip(state))]
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/v1", v1::router())
        .fallback(handle_404)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_404() -> ApiError {
    ApiError::not_found("404 Not Found")
}
