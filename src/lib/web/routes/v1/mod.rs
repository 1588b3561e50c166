use axum::Router;
use tracing::*;

use crate::web::AppState;

pub mod info;
pub mod log;
pub mod statistics;

#[instrument(level = "trace")]
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/statistics", statistics::router())
        .nest("/log", log::router())
        .nest("/info", info::router())
}
