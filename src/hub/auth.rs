//! Bearer-token guard for the control API

use super::common::ApiError;
use super::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Reachable without a token
const OPEN_ROUTES: &[&str] = &["/", "/version"];

/// Reject requests without the configured secret as a Bearer token
///
/// An empty secret disables the check.
pub async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.secret.is_empty() || OPEN_ROUTES.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let presented = bearer_token(req.headers()).map(|token| token_matches(token, &state.secret));
    if presented == Some(true) {
        return next.run(req).await;
    }

    debug!(
        "Rejected {} {}: {}",
        req.method(),
        req.uri().path(),
        if presented.is_some() { "wrong token" } else { "no token" }
    );
    unauthorized()
}

/// Token of an `Authorization: Bearer <token>` header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

fn token_matches(presented: &str, secret: &str) -> bool {
    presented.as_bytes().ct_eq(secret.as_bytes()).into()
}

fn unauthorized() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new("Missing or invalid bearer token")),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}
