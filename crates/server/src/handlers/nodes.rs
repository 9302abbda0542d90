//! Endpoints called by edge and candidate nodes.

use super::{ok, ApiError, ApiResult};
use crate::middleware::CallerIdentity;
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use stratus_core::auth::Permission;
use stratus_core::types::{
    CacheResultInfo, NodeBlockDownloadResult, NodeType, RemoveCarfileResultInfo, ValidateResults,
};
use stratus_core::CoreError;

#[derive(Debug, Deserialize)]
pub struct ConnectBody {
    #[serde(default)]
    pub public_key: String,
}

fn require_device(identity: &CallerIdentity) -> Result<String, ApiError> {
    identity
        .device_id
        .clone()
        .ok_or_else(|| ApiError(CoreError::InvalidRequest("missing X-Device-ID header".into())))
}

pub async fn edge_connect(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ConnectBody>,
) -> ApiResult<serde_json::Value> {
    let device_id = require_device(&identity)?;
    state
        .scheduler
        .node_connect(&device_id, NodeType::Edge, &addr.to_string(), body.public_key)
        .await?;
    Ok(ok())
}

pub async fn candidate_connect(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ConnectBody>,
) -> ApiResult<serde_json::Value> {
    let device_id = require_device(&identity)?;
    state
        .scheduler
        .node_connect(&device_id, NodeType::Candidate, &addr.to_string(), body.public_key)
        .await?;
    Ok(ok())
}

pub async fn disconnect(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
) -> ApiResult<serde_json::Value> {
    let device_id = require_device(&identity)?;
    state.scheduler.node_disconnect(&device_id).await?;
    Ok(ok())
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
) -> ApiResult<serde_json::Value> {
    let device_id = require_device(&identity)?;
    state.scheduler.node_heartbeat(&device_id);
    Ok(ok())
}

/// An audited node's challenge outcome, relayed by its validator.
pub async fn validate_result(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(results): Json<ValidateResults>,
) -> ApiResult<serde_json::Value> {
    let validator_id = require_device(&identity)?;
    state.scheduler.validate_block_result(&validator_id, results).await?;
    Ok(ok())
}

pub async fn cache_result(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(info): Json<CacheResultInfo>,
) -> ApiResult<serde_json::Value> {
    let device_id = require_device(&identity)?;
    state.scheduler.cache_result(&device_id, info).await?;
    Ok(ok())
}

pub async fn remove_result(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(info): Json<RemoveCarfileResultInfo>,
) -> ApiResult<serde_json::Value> {
    let device_id = require_device(&identity)?;
    state.scheduler.remove_carfile_result(&device_id, info).await?;
    Ok(ok())
}

pub async fn download_result(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(result): Json<NodeBlockDownloadResult>,
) -> ApiResult<serde_json::Value> {
    let device_id = require_device(&identity)?;
    state.scheduler.node_download_result(&device_id, result).await?;
    Ok(ok())
}

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
}

pub async fn public_key(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
) -> ApiResult<PublicKeyResponse> {
    let device_id = require_device(&identity)?;
    let public_key = state.scheduler.public_key(&device_id)?;
    Ok(Json(PublicKeyResponse { public_key }))
}

#[derive(Debug, Serialize)]
pub struct ExternalAddrResponse {
    pub addr: String,
}

pub async fn external_addr(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<ExternalAddrResponse> {
    Json(ExternalAddrResponse { addr: addr.to_string() })
}

#[derive(Debug, Deserialize)]
pub struct AuthNewBody {
    pub perms: Vec<String>,
    pub device_id: String,
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Token issuance. Self-authenticating: the registration secret is the
/// credential, so this endpoint sits outside the bearer middleware.
pub async fn auth_new(
    State(state): State<AppState>,
    Json(body): Json<AuthNewBody>,
) -> ApiResult<TokenResponse> {
    let mut perms = Vec::with_capacity(body.perms.len());
    for raw in &body.perms {
        let perm = Permission::parse(raw).ok_or_else(|| {
            ApiError(CoreError::InvalidRequest(format!("unknown permission: {raw}")))
        })?;
        perms.push(perm);
    }
    let token = state.scheduler.auth_node_new(&perms, &body.device_id, &body.secret).await?;
    Ok(Json(TokenResponse { token }))
}

#[derive(Debug, Deserialize)]
pub struct AuthVerifyBody {
    pub token: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthVerifyResponse {
    pub perms: Vec<Permission>,
}

pub async fn auth_verify(
    State(state): State<AppState>,
    Json(body): Json<AuthVerifyBody>,
) -> ApiResult<AuthVerifyResponse> {
    let perms = state.scheduler.auth_verify(&body.token, body.device_id.as_deref()).await?;
    Ok(Json(AuthVerifyResponse { perms }))
}
