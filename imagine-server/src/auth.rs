//! Bearer token gate.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use imagine_core::api::ErrorBody;
use thiserror::Error;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("No authorization token provided")]
    MissingToken,
    #[error("Invalid authorization header format")]
    InvalidFormat,
    #[error("Invalid authentication scheme")]
    InvalidScheme,
    #[error("Invalid token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Checks an `Authorization: Bearer <token>` header against `expected`.
pub fn check_authorization(headers: &HeaderMap, expected: &str) -> Result<(), AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;

    let parts: Vec<&str> = header.split_whitespace().collect();
    let [scheme, token] = parts.as_slice() else {
        return Err(AuthError::InvalidFormat);
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidScheme);
    }
    if *token != expected {
        return Err(AuthError::InvalidToken);
    }
    Ok(())
}

/// Rejects requests without the configured token. A no-op when the server
/// runs without one.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if let Some(expected) = state.auth_token.as_deref() {
        if let Err(err) = check_authorization(request.headers(), expected) {
            warn!(path = %request.uri().path(), "Rejected request: {err}");
            return Err(err);
        }
    }
    Ok(next.run(request).await)
}
