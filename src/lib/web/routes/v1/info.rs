use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tracing::*;

use crate::{statistics::WorkMode, web::AppState};

#[derive(Serialize, Debug)]
pub struct InfoContent {
    /// Name of the program
    name: String,
    version: String,
    build_date: String,
    target: String,
    /// Authors name
    authors: String,
}

#[derive(Serialize, Debug)]
pub struct Info {
    /// Version of the REST API
    version: u32,
    /// Service information
    service: InfoContent,
    work_mode: Option<WorkMode>,
    devices: usize,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(info))
}

#[instrument(level = "trace", skip(state))]
async fn info(State(state): State<AppState>) -> Json<Info> {
    let work_mode = state
        .manager
        .work_mode()
        .await
        .inspect_err(|error| warn!("Failed reading work mode: {error:?}"))
        .ok();
    let devices = state
        .manager
        .devices()
        .await
        .map(|devices| devices.len())
        .unwrap_or_default();

    Json(Info {
        version: 1,
        service: InfoContent {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            build_date: env!("VERGEN_BUILD_TIMESTAMP").into(),
            target: env!("VERGEN_CARGO_TARGET_TRIPLE").into(),
            authors: env!("CARGO_PKG_AUTHORS").into(),
        },
        work_mode,
        devices,
    })
}
