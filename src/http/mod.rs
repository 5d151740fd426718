//! Thin HTTP surface over [`Bridge`]
//!
//! # Endpoints
//!
//! - `GET /` - Service info and endpoint list
//! - `POST /status` - Submit a status snapshot (202, 422 on invalid input)
//! - `GET /status` - Latest snapshot
//! - `GET /status/history?limit=N` - Recent snapshots, oldest first
//! - `POST /control` - Send a control command (202)
//! - `GET /health` - Server and broker health
//! - `GET /files` - Files saved according to the latest snapshot
//! - `GET /metrics` - Current metrics, 404 before any status

pub mod handlers;
pub mod routes;

use crate::bridge::Bridge;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(bridge: Arc<Bridge>) -> Router {
    routes::api_routes()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}
