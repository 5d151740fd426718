//! Route table for the control/status API.

use super::handlers;
use crate::bridge::Bridge;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub fn api_routes() -> Router<Arc<Bridge>> {
    Router::new()
        .route("/", get(handlers::root))
        .route(
            "/status",
            post(handlers::submit_status).get(handlers::get_status),
        )
        .route("/status/history", get(handlers::status_history))
        .route("/control", post(handlers::control))
        .route("/health", get(handlers::health))
        .route("/files", get(handlers::files))
        .route("/metrics", get(handlers::metrics))
}
