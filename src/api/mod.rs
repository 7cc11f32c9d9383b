//! HTTP API for the sync server
//!
//! - `GET  /health`
//! - `GET  /api/v1/sync/down?last_sync=<ISO-8601>`
//! - `POST /api/v1/sync/up`
//!
//! Authentication happens upstream; the caller's identity arrives in the
//! `x-assessor-id` and `x-tenant-id` headers.

pub mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::sync::transport::{SYNC_DOWN_PATH, SYNC_UP_PATH};
use crate::sync::SyncServer;

/// Create the sync API router
pub fn create_router(server: SyncServer) -> Router {
    Router::new()
        .route(SYNC_DOWN_PATH, get(routes::sync_down))
        .route(SYNC_UP_PATH, post(routes::sync_up))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}
