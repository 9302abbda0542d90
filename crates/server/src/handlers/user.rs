//! Read-side endpoints for users and tooling.

use super::ApiResult;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use stratus_core::types::{
    CarfileRecord, CarfileRecordPage, DeviceInfo, DownloadInfo, NodeType, Replica,
};

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    #[serde(flatten)]
    pub record: CarfileRecord,
    pub replicas: Vec<Replica>,
}

pub async fn record_info(
    State(state): State<AppState>,
    Path(carfile_cid): Path<String>,
) -> ApiResult<RecordResponse> {
    let (record, replicas) = state.scheduler.record_info(&carfile_cid).await?;
    Ok(Json(RecordResponse { record, replicas }))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: usize,
}

pub async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<CarfileRecordPage> {
    Ok(Json(state.scheduler.list_records(query.page.max(1)).await?))
}

pub async fn running_records(State(state): State<AppState>) -> ApiResult<Vec<CarfileRecord>> {
    Ok(Json(state.scheduler.running_records().await?))
}

pub async fn undone_records(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<CarfileRecordPage> {
    Ok(Json(state.scheduler.undone_records(query.page.max(1)).await?))
}

#[derive(Debug, Deserialize)]
pub struct OnlineQuery {
    /// `edge`, `candidate`, or `validator`.
    pub node_type: String,
}

pub async fn online_devices(
    State(state): State<AppState>,
    Query(query): Query<OnlineQuery>,
) -> ApiResult<Vec<String>> {
    let ids = match query.node_type.as_str() {
        "edge" => state.scheduler.online_devices(NodeType::Edge),
        "candidate" => state.scheduler.online_devices(NodeType::Candidate),
        "validator" => state.scheduler.online_validators().await?,
        other => {
            return Err(super::ApiError(stratus_core::CoreError::InvalidRequest(format!(
                "unknown node type: {other}"
            ))))
        }
    };
    Ok(Json(ids))
}

pub async fn devices_info(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<DeviceInfo> {
    Ok(Json(state.scheduler.devices_info(&device_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub public_key: String,
}

pub async fn download_infos(
    State(state): State<AppState>,
    Path(carfile_cid): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Vec<DownloadInfo>> {
    Ok(Json(state.scheduler.download_infos(&carfile_cid, &query.public_key).await?))
}
