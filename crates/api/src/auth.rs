//! Caller identity middleware
//!
//! Authentication happens in front of this service. The fronting layer
//! forwards the resolved caller as `X-Customer-Id` and `X-Role`; admin
//! routes also carry the operator bearer token.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subledger_billing::{Actor, Role};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";
pub const ROLE_HEADER: &str = "x-role";

/// Authenticated caller, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub actor: Actor,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing caller identity")]
    MissingIdentity,
    #[error("Unknown role")]
    InvalidRole,
    #[error("Missing admin token")]
    MissingToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingIdentity => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidRole => (StatusCode::UNAUTHORIZED, "Invalid caller role"),
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Admin token required"),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn extract_actor(headers: &HeaderMap) -> Result<Actor, AuthError> {
    let customer_id = header_str(headers, CUSTOMER_ID_HEADER).ok_or(AuthError::MissingIdentity)?;
    let role = match header_str(headers, ROLE_HEADER) {
        None | Some("customer") => Role::Customer,
        Some("admin") => Role::Admin,
        Some(_) => return Err(AuthError::InvalidRole),
    };

    Ok(Actor {
        customer_id: customer_id.to_string(),
        role,
    })
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Middleware that requires a caller identity
pub async fn require_identity(mut request: Request, next: Next) -> Response {
    match extract_actor(request.headers()) {
        Ok(actor) => {
            request.extensions_mut().insert(AuthUser { actor });
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %request.uri().path(), error = %err, "Rejected request without identity");
            err.into_response()
        }
    }
}

/// Middleware that requires the admin role and the operator token
pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let actor = match extract_actor(request.headers()) {
        Ok(actor) => actor,
        Err(err) => return err.into_response(),
    };
    if !actor.is_admin() {
        tracing::warn!(
            customer_id = %actor.customer_id,
            path = %request.uri().path(),
            "Non-admin caller on admin route"
        );
        return AuthError::InsufficientPermissions.into_response();
    }

    let Some(token) = extract_bearer_token(request.headers()) else {
        return AuthError::MissingToken.into_response();
    };
    let expected = state.config.admin_api_token.as_bytes();
    if !bool::from(token.as_bytes().ct_eq(expected)) {
        tracing::warn!(customer_id = %actor.customer_id, "Admin token mismatch");
        return AuthError::InsufficientPermissions.into_response();
    }

    request.extensions_mut().insert(AuthUser { actor });
    next.run(request).await
}
