//! Bearer-token authentication middleware.
//!
//! Every protected route group carries a [`RequiredPerm`] extension; the
//! middleware verifies the bearer token against it. A request with an
//! `X-Device-ID` header is verified against that device's registration
//! secret (so nodes cannot present tokens minted for other devices);
//! everything else is checked against the scheduler's global secret.

use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use stratus_core::auth::Permission;
use tracing::debug;

/// Permission a route group demands.
#[derive(Debug, Clone, Copy)]
pub struct RequiredPerm(pub Permission);

/// Verified caller identity attached to the request.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub device_id: Option<String>,
    pub permissions: Vec<Permission>,
}

fn denied(msg: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": msg }))).into_response()
}

pub async fn require_permission(
    State(state): State<AppState>,
    Extension(RequiredPerm(required)): Extension<RequiredPerm>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request) else {
        return denied("missing bearer token");
    };
    let device_id = request
        .headers()
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let permissions = match state.scheduler.auth_verify(&token, device_id.as_deref()).await {
        Ok(perms) => perms,
        Err(e) => {
            debug!(error = %e, "token verification failed");
            return denied("invalid token");
        }
    };

    // Admin implies every other permission.
    let allowed = permissions.contains(&required) || permissions.contains(&Permission::Admin);
    if !allowed {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": format!("requires {required} permission") })),
        )
            .into_response();
    }

    request.extensions_mut().insert(CallerIdentity { device_id, permissions });
    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}
