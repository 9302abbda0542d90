//! Route layout.
//!
//! Three protected groups plus a small public surface:
//!
//! | Group | Prefix | Required permission |
//! |-------|--------|---------------------|
//! | Node callbacks | `/node` | `write` |
//! | Operator | `/admin` | `admin` |
//! | Queries | `/` | `read` |
//!
//! Token issuance/verification, health, and metrics are public — issuance is
//! self-authenticating via the registration secret.

use crate::handlers::{admin, nodes, user};
use crate::middleware::{require_permission, RequiredPerm};
use crate::state::AppState;
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Json, Router,
};
use stratus_core::auth::Permission;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    let node_routes = Router::new()
        .route("/edge/connect", post(nodes::edge_connect))
        .route("/candidate/connect", post(nodes::candidate_connect))
        .route("/disconnect", post(nodes::disconnect))
        .route("/heartbeat", post(nodes::heartbeat))
        .route("/validate-result", post(nodes::validate_result))
        .route("/cache-result", post(nodes::cache_result))
        .route("/remove-result", post(nodes::remove_result))
        .route("/download-result", post(nodes::download_result))
        .route("/public-key", get(nodes::public_key))
        .route("/external-addr", get(nodes::external_addr))
        .route_layer(from_fn_with_state(state.clone(), require_permission))
        .route_layer(Extension(RequiredPerm(Permission::Write)));

    let admin_routes = Router::new()
        .route("/carfile/cache", post(admin::cache_carfile))
        .route("/carfile/remove", post(admin::remove_carfile))
        .route("/carfile/remove-replica", post(admin::remove_replica))
        .route("/carfile/stop", post(admin::stop_cache_task))
        .route("/carfile/reset-expiry", post(admin::reset_expired_time))
        .route("/carfile/execute-undone", post(admin::execute_undone))
        .route("/election", post(admin::election_validators))
        .route("/validate/switch", post(admin::validate_switch))
        .route("/validate/state", get(admin::validate_state))
        .route("/validate/start", post(admin::validate_start))
        .route("/node/quit", post(admin::node_quit))
        .route("/node/register", post(admin::register_nodes))
        .route("/replication/backup-count", post(admin::reset_backup_cache_count))
        .route_layer(from_fn_with_state(state.clone(), require_permission))
        .route_layer(Extension(RequiredPerm(Permission::Admin)));

    let query_routes = Router::new()
        .route("/carfiles", get(user::list_records))
        .route("/carfiles/running", get(user::running_records))
        .route("/carfiles/undone", get(user::undone_records))
        .route("/carfile/:carfile_cid", get(user::record_info))
        .route("/download-infos/:carfile_cid", get(user::download_infos))
        .route("/nodes/online", get(user::online_devices))
        .route("/devices/:device_id", get(user::devices_info))
        .route_layer(from_fn_with_state(state.clone(), require_permission))
        .route_layer(Extension(RequiredPerm(Permission::Read)));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .route("/auth/new", post(nodes::auth_new))
        .route("/auth/verify", post(nodes::auth_verify))
        .nest("/node", node_routes)
        .nest("/admin", admin_routes)
        .merge(query_routes)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> String {
    state.prometheus.as_ref().map(|handle| handle.render()).unwrap_or_default()
}
