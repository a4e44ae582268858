//! Tunnel endpoints

use super::common::{ApiError, ApiResult, ConnectRequest, PreviewRequest};
use super::AppState;
use crate::config::builder::{document_for_link, normalize};
use crate::config::document::ConfigDocument;
use crate::tunnel::{TunnelSource, TunnelState, TunnelStatus};
use crate::Error;
use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use tracing::{error, info};

/// GET /tunnel - current status
pub async fn get_tunnel(State(state): State<AppState>) -> Json<TunnelStatus> {
    Json(state.manager.status())
}

/// POST /tunnel - run one connect attempt
///
/// Answers once the attempt has either reached `running` or failed. The
/// attempt runs in its own task and keeps the operation lock until it ends,
/// so a client hanging up does not cut it short.
pub async fn connect(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<TunnelStatus>> {
    let guard = state
        .connect_guard
        .clone()
        .try_lock_owned()
        .map_err(|_| ApiError::conflict("A tunnel operation is already in progress"))?;

    let current = state.manager.state();
    if current == TunnelState::Running || current.is_in_flight() {
        return Err(ApiError::conflict(format!(
            "Tunnel is {}; stop it first",
            current
        )));
    }

    let body: ConnectRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ConnectRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?
    };
    let source = match (body.link, body.document) {
        (Some(_), Some(_)) => {
            return Err(ApiError::bad_request(
                "Provide either a link or a document, not both",
            ))
        }
        (Some(link), None) => TunnelSource::Link {
            link,
            policy: body.routing.unwrap_or_default(),
        },
        (None, Some(document)) => {
            let document: ConfigDocument = serde_json::from_value(document)
                .map_err(|e| ApiError::bad_request(format!("Invalid document: {}", e)))?;
            TunnelSource::Document(document)
        }
        (None, None) => TunnelSource::Saved,
    };

    info!("Connect requested via control API");
    let manager = state.manager.clone();
    let attempt = tokio::spawn(async move {
        let result = manager.connect(source).await;
        drop(guard);
        result
    });
    match attempt.await {
        Ok(result) => result.map(Json).map_err(|e| ApiError::tunnel(&e)),
        Err(e) => {
            error!("Connect task failed: {}", e);
            Err(ApiError::internal("Connect attempt ended unexpectedly"))
        }
    }
}

/// DELETE /tunnel - stop the tunnel
pub async fn disconnect(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let _guard = state
        .connect_guard
        .try_lock()
        .map_err(|_| ApiError::conflict("A tunnel operation is already in progress"))?;

    info!("Stop requested via control API");
    state.manager.stop().await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /config/preview - the document a link would run with
///
/// With `check`, the engine must accept the document too (422 otherwise).
pub async fn preview(
    State(state): State<AppState>,
    Json(body): Json<PreviewRequest>,
) -> ApiResult<Json<ConfigDocument>> {
    let (_, document) = document_for_link(&body.link, &body.routing).map_err(|e| {
        if e.is_link_error() || matches!(e, Error::NotFound) {
            ApiError::bad_request(e.to_string())
        } else {
            ApiError::internal(e.to_string())
        }
    })?;
    let document = normalize(document);

    if body.check {
        state.manager.test_document(&document).await.map_err(|e| match e {
            Error::Engine(reason) => ApiError::unprocessable(format!("Engine rejected document: {}", reason)),
            other => ApiError::internal(other.to_string()),
        })?;
    }
    Ok(Json(document))
}
