//! Sync API handlers

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorCategory};
use crate::sync::transport::{ASSESSOR_HEADER, TENANT_HEADER};
use crate::sync::{AssessorIdentity, SyncDownResponse, SyncServer, SyncUpRequest, SyncUpResponse};

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Errors surfaced by the API as `{error}` bodies
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e.category() {
            ErrorCategory::Storage => {
                error!(error = %e, "Sync request failed");
                ApiError::Internal(e.to_string())
            }
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

fn header_id(headers: &HeaderMap, name: &str) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(name)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", name)))?;
    raw.to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("malformed {} header", name)))
}

fn identity(headers: &HeaderMap) -> Result<AssessorIdentity, ApiError> {
    Ok(AssessorIdentity {
        assessor_id: header_id(headers, ASSESSOR_HEADER)?,
        tenant_id: header_id(headers, TENANT_HEADER)?,
    })
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct SyncDownQuery {
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

/// GET /api/v1/sync/down
pub async fn sync_down(
    State(server): State<SyncServer>,
    headers: HeaderMap,
    query: Result<Query<SyncDownQuery>, QueryRejection>,
) -> Result<Json<SyncDownResponse>, ApiError> {
    let identity = identity(&headers)?;
    let Query(query) = query.map_err(|e| {
        warn!(error = %e, "Rejected sync-down query");
        ApiError::BadRequest(e.body_text())
    })?;

    let response = tokio::task::spawn_blocking(move || server.pull(&identity, query.last_sync))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(response))
}

/// POST /api/v1/sync/up
pub async fn sync_up(
    State(server): State<SyncServer>,
    headers: HeaderMap,
    body: Result<Json<SyncUpRequest>, JsonRejection>,
) -> Result<Json<SyncUpResponse>, ApiError> {
    let identity = identity(&headers)?;
    let Json(request) = body.map_err(|e| {
        warn!(error = %e, "Rejected sync-up body");
        ApiError::BadRequest(e.body_text())
    })?;

    let response = tokio::task::spawn_blocking(move || server.push(&identity, request))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(response))
}
