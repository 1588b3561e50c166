use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    device::DatapathId,
    statistics::{ManagedDeviceInfo, WorkMode},
    store::DeviceItems,
    web::{ApiError, AppState},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkModeContent {
    pub mode: WorkMode,
}

#[derive(Serialize, Debug)]
pub struct DeviceStatistics {
    pub device: ManagedDeviceInfo,
    pub store: Option<DeviceItems>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/work-mode", get(work_mode).post(change_work_mode))
        .route("/devices", get(devices))
        .route("/devices/{datapath_id}", get(device))
}

#[instrument(level = "trace", skip(state))]
async fn work_mode(State(state): State<AppState>) -> Result<Json<WorkModeContent>, ApiError> {
    let mode = state.manager.work_mode().await?;
    Ok(Json(WorkModeContent { mode }))
}

/// Answers once every managed device runs in the requested mode.
#[instrument(level = "debug", skip(state))]
async fn change_work_mode(
    State(state): State<AppState>,
    Json(WorkModeContent { mode }): Json<WorkModeContent>,
) -> Result<Json<WorkModeContent>, ApiError> {
    state.manager.change_work_mode(mode).await?;
    let mode = state.manager.work_mode().await?;
    Ok(Json(WorkModeContent { mode }))
}

#[instrument(level = "trace", skip(state))]
async fn devices(State(state): State<AppState>) -> Result<Json<Vec<ManagedDeviceInfo>>, ApiError> {
    Ok(Json(state.manager.devices().await?))
}

#[instrument(level = "trace", skip(state))]
async fn device(
    State(state): State<AppState>,
    Path(datapath_id): Path<String>,
) -> Result<Json<DeviceStatistics>, ApiError> {
    let datapath_id = datapath_id
        .parse::<DatapathId>()
        .map_err(|error| ApiError::bad_request(format!("Invalid datapath id: {error}")))?;

    let device = state
        .manager
        .device(datapath_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Device {datapath_id} is not managed")))?;
    let store = state.store.device(datapath_id).await;

    Ok(Json(DeviceStatistics { device, store }))
}
