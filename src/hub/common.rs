//! Common types for REST API responses and errors

use crate::rule::RoutingPolicy;
use crate::tunnel::TunnelError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// API error response
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,

    /// Failure kind for tunnel errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
            kind: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
    }

    pub fn conflict(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::CONFLICT, Json(ApiError::new(message)))
    }

    pub fn unprocessable(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::UNPROCESSABLE_ENTITY, Json(ApiError::new(message)))
    }

    pub fn internal(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(message)))
    }

    /// Status and user-facing message for a failed connect
    pub fn tunnel(err: &TunnelError) -> (StatusCode, Json<ApiError>) {
        let (status, kind) = match err {
            TunnelError::NoConfiguration => (StatusCode::BAD_REQUEST, "no-configuration"),
            TunnelError::EngineStartTimeout => (StatusCode::GATEWAY_TIMEOUT, "engine-start-timeout"),
            TunnelError::EngineStartFailed(_) => (StatusCode::BAD_GATEWAY, "engine-start-failed"),
            TunnelError::SettingsApplyFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "settings-apply-failed")
            }
        };
        (
            status,
            Json(ApiError {
                message: err.user_message(),
                kind: Some(kind),
            }),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// Connect request body
///
/// With neither `link` nor `document` the saved profile is used.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    /// Proxy link or subscription blob
    pub link: Option<String>,
    /// Complete engine document
    pub document: Option<Value>,
    /// Routing policy applied to `link`
    pub routing: Option<RoutingPolicy>,
}

/// Document preview request body
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub link: String,
    #[serde(default)]
    pub routing: RoutingPolicy,
    /// Also have the engine check the document
    #[serde(default)]
    pub check: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error() {
        let err = ApiError::new("test error");
        assert_eq!(err.message, "test error");
        assert!(serde_json::to_value(&err).unwrap().get("kind").is_none());
    }

    #[test]
    fn test_tunnel_error_statuses() {
        let (status, body) = ApiError::tunnel(&TunnelError::EngineStartTimeout);
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body.kind, Some("engine-start-timeout"));

        let (status, body) =
            ApiError::tunnel(&TunnelError::SettingsApplyFailed("EPERM".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.message.contains("EPERM"));
    }

    #[test]
    fn test_connect_request_defaults() {
        let body: ConnectRequest = serde_json::from_str("{}").unwrap();
        assert!(body.link.is_none() && body.document.is_none() && body.routing.is_none());

        let body: ConnectRequest = serde_json::from_str(
            r#"{"link":"vless://x@h:1","routing":{"country-code":"DE","bypass-tld":true}}"#,
        )
        .unwrap();
        assert_eq!(body.routing.unwrap().country_code.as_deref(), Some("DE"));
    }
}
