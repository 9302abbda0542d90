//! Operator endpoints.

use super::{ok, ApiResult};
use crate::state::AppState;
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_core::types::{CacheCarfileInfo, NodeRegisterInfo, NodeType};

pub async fn cache_carfile(
    State(state): State<AppState>,
    Json(info): Json<CacheCarfileInfo>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.cache_carfile(info).await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct CarfileBody {
    pub carfile_cid: String,
}

pub async fn remove_carfile(
    State(state): State<AppState>,
    Json(body): Json<CarfileBody>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.remove_carfile(&body.carfile_cid).await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct RemoveReplicaBody {
    pub carfile_cid: String,
    pub device_id: String,
}

pub async fn remove_replica(
    State(state): State<AppState>,
    Json(body): Json<RemoveReplicaBody>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.remove_replica(&body.carfile_cid, &body.device_id).await?;
    Ok(ok())
}

pub async fn stop_cache_task(
    State(state): State<AppState>,
    Json(body): Json<CarfileBody>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.stop_cache_task(&body.carfile_cid).await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct ResetExpiryBody {
    pub carfile_cid: String,
    pub expired_time: DateTime<Utc>,
}

pub async fn reset_expired_time(
    State(state): State<AppState>,
    Json(body): Json<ResetExpiryBody>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.reset_expired_time(&body.carfile_cid, body.expired_time).await?;
    Ok(ok())
}

#[derive(Debug, Serialize)]
pub struct UndoneResponse {
    pub enqueued: usize,
}

pub async fn execute_undone(State(state): State<AppState>) -> ApiResult<UndoneResponse> {
    let enqueued = state.scheduler.execute_undone_task().await?;
    Ok(Json(UndoneResponse { enqueued }))
}

#[derive(Debug, Serialize)]
pub struct ElectionResponse {
    pub validators: Vec<String>,
}

pub async fn election_validators(State(state): State<AppState>) -> ApiResult<ElectionResponse> {
    let validators = state.scheduler.election_validators().await?;
    Ok(Json(ElectionResponse { validators }))
}

#[derive(Debug, Deserialize)]
pub struct ValidateSwitchBody {
    pub enable: bool,
}

pub async fn validate_switch(
    State(state): State<AppState>,
    Json(body): Json<ValidateSwitchBody>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.validate_switch(body.enable);
    Ok(ok())
}

#[derive(Debug, Serialize)]
pub struct ValidateStateResponse {
    pub enabled: bool,
}

pub async fn validate_state(State(state): State<AppState>) -> ApiResult<ValidateStateResponse> {
    Ok(Json(ValidateStateResponse { enabled: state.scheduler.validate_running_state() }))
}

pub async fn validate_start(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    state.scheduler.validate_start().await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct NodeQuitBody {
    pub device_ids: Vec<String>,
}

pub async fn node_quit(
    State(state): State<AppState>,
    Json(body): Json<NodeQuitBody>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.node_quit(&body.device_ids).await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub node_type: NodeType,
    pub count: usize,
}

pub async fn register_nodes(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<Vec<NodeRegisterInfo>> {
    let infos = state.scheduler.register_nodes(body.node_type, body.count).await?;
    Ok(Json(infos))
}

#[derive(Debug, Deserialize)]
pub struct BackupCountBody {
    pub count: u32,
}

pub async fn reset_backup_cache_count(
    State(state): State<AppState>,
    Json(body): Json<BackupCountBody>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.reset_backup_cache_count(body.count);
    Ok(ok())
}
