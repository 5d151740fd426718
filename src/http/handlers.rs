//! HTTP request handlers
//!
//! Bodies are taken as raw bytes and parsed here so that malformed JSON and
//! schema violations both come back as 422 with the same error shape.

use crate::bridge::Bridge;
use crate::error::{BridgeError, ValidationError};
use crate::mqtt::ConnectionState;
use crate::status::model::unix_now;
use crate::status::{StatusSnapshot, MAX_HISTORY_LIMIT};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SERVICE_NAME: &str = "Loki Media Player Control API";
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub status: &'static str,
    pub error: String,
    pub code: u16,
}

impl ApiError {
    fn new(code: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status: "error",
            error: error.into(),
            code: code.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Validation(e) => e.into(),
            BridgeError::Closed => Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        warn!("Rejected query string: {}", rejection.body_text());
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    }
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        warn!("Rejected request body: {}", e);
        ApiError::from(ValidationError::from(e))
    })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub data: StatusSnapshot,
    pub message: &'static str,
}

#[derive(Serialize)]
pub struct ControlResponse {
    pub status: &'static str,
    pub message: String,
    pub command_sent: bool,
    pub command_id: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub server_status: &'static str,
    pub mqtt_connected: bool,
    pub connection_state: ConnectionState,
    pub timestamp: i64,
    pub has_status_data: bool,
    pub uptime_seconds: f64,
    pub last_status_time: Option<i64>,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub history: Vec<StatusSnapshot>,
    pub count: usize,
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /
pub async fn root(State(bridge): State<Arc<Bridge>>) -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "mqtt_connected": bridge.health().connected,
        "timestamp": unix_now(),
        "endpoints": [
            {"path": "/status", "method": "GET", "description": "Latest player status"},
            {"path": "/status", "method": "POST", "description": "Submit player status"},
            {"path": "/status/history", "method": "GET", "description": "Recent status history"},
            {"path": "/control", "method": "POST", "description": "Send a control command"},
            {"path": "/health", "method": "GET", "description": "Server and broker health"},
            {"path": "/files", "method": "GET", "description": "Files saved by the player"},
            {"path": "/metrics", "method": "GET", "description": "Current player metrics"}
        ]
    }))
}

/// POST /status
pub async fn submit_status(
    State(bridge): State<Arc<Bridge>>,
    body: Bytes,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    let value = parse_body(&body)?;
    let snapshot = bridge.submit_status(value).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            status: "success",
            data: snapshot,
            message: "Status updated successfully",
        }),
    ))
}

/// GET /status
pub async fn get_status(State(bridge): State<Arc<Bridge>>) -> Json<StatusResponse> {
    let response = match bridge.latest_status() {
        Some(snapshot) => StatusResponse {
            status: "success",
            data: snapshot,
            message: "Latest status retrieved successfully",
        },
        None => StatusResponse {
            status: "no_data",
            data: StatusSnapshot::default(),
            message: "No status has been received yet",
        },
    };
    Json(response)
}

/// GET /status/history?limit=N
pub async fn status_history(
    State(bridge): State<Arc<Bridge>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let history = bridge.history(limit);
    Ok(Json(HistoryResponse {
        count: history.len(),
        history,
        limit,
    }))
}

/// POST /control
pub async fn control(
    State(bridge): State<Arc<Bridge>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ControlResponse>), ApiError> {
    let value = parse_body(&body)?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let receipt = bridge.send_command(value)?;
    info!("Command '{}' accepted as {}", action, receipt.command_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(ControlResponse {
            status: "success",
            message: format!("Command '{}' is being processed", action),
            command_sent: receipt.accepted,
            command_id: receipt.command_id,
        }),
    ))
}

/// GET /health
pub async fn health(State(bridge): State<Arc<Bridge>>) -> Json<HealthResponse> {
    let health = bridge.health();
    if !health.connected {
        debug!("Health check while MQTT is {:?}", health.state);
    }
    Json(HealthResponse {
        server_status: "running",
        mqtt_connected: health.connected,
        connection_state: health.state,
        timestamp: unix_now(),
        has_status_data: health.has_data,
        uptime_seconds: health.uptime_seconds,
        last_status_time: health.last_status_time,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /files
pub async fn files(State(bridge): State<Arc<Bridge>>) -> Json<Value> {
    match bridge.saved_files() {
        Some((files, timestamp)) => {
            let last_updated = DateTime::<Utc>::from_timestamp(timestamp, 0).map(|t| t.to_rfc3339());
            Json(json!({
                "count": files.len(),
                "files": files,
                "timestamp": timestamp,
                "last_updated": last_updated,
            }))
        }
        None => Json(json!({
            "files": [],
            "count": 0,
            "message": "No status has been received yet",
        })),
    }
}

/// GET /metrics
pub async fn metrics(State(bridge): State<Arc<Bridge>>) -> Result<Response, ApiError> {
    match bridge.metrics() {
        Some(metrics) => Ok(Json(metrics).into_response()),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "No status has been received yet",
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::bridge::Bridge;
    use crate::config::BridgeConfig;
    use crate::http::build_router;
    use crate::mqtt::testing::{ScriptedTransport, Step};
    use crate::mqtt::BrokerEndpoint;
    use axum::body::{self, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt; // for `oneshot`

    async fn app(connect: bool) -> (Router, Arc<Bridge>) {
        let mut config = BridgeConfig::default();
        config.mqtt.broker = BrokerEndpoint::new("primary.local", 1883);
        config.mqtt.fallback = None;
        let transport = Arc::new(ScriptedTransport::new([Step::Accept]));
        let bridge = Bridge::new(config, transport);
        if connect {
            bridge.start().await;
        }
        (build_router(bridge.clone()), bridge)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: impl Into<String>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.into()))
            .unwrap()
    }

    #[tokio::test]
    async fn status_round_trip() {
        let (app, _) = app(true).await;
        let snapshot = json!({
            "timestamp": 1700000000,
            "queue_length": 3,
            "fps": 29.97,
            "saved_files": ["/data/rec_0001.mp4"],
            "sync_status": "synced",
            "sensor_status": "active"
        });

        let (status, body) = call(&app, post("/status", snapshot.to_string())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"], snapshot);

        let (status, body) = call(&app, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"], snapshot);

        let (_, body) = call(&app, get("/status/history")).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["limit"], 10);
        assert_eq!(body["history"][0], snapshot);
    }

    #[tokio::test]
    async fn status_without_data() {
        let (app, _) = app(false).await;
        let (status, body) = call(&app, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "no_data");
        assert_eq!(body["data"]["sync_status"], "unknown");

        let (status, _) = call(&app, get("/metrics")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, get("/files")).await;
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn invalid_status_is_unprocessable() {
        let (app, bridge) = app(false).await;
        let (status, body) = call(&app, post("/status", r#"{"sync_status":"weird"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "error");

        let (status, _) = call(&app, post("/status", "{not json")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(&app, post("/status", r#"{"fps":-1.0}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        assert!(bridge.latest_status().is_none());
    }

    #[tokio::test]
    async fn history_limit_is_clamped() {
        let (app, _) = app(false).await;
        for n in 0..120 {
            let (status, _) = call(&app, post("/status", json!({"queue_length": n}).to_string())).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        let (_, body) = call(&app, get("/status/history?limit=500")).await;
        assert_eq!(body["limit"], 100);
        assert_eq!(body["count"], 100);
        assert_eq!(body["history"][0]["queue_length"], 20);
        assert_eq!(body["history"][99]["queue_length"], 119);

        let (_, body) = call(&app, get("/status/history?limit=3")).await;
        assert_eq!(body["count"], 3);
        assert_eq!(body["history"][2]["queue_length"], 119);
    }

    #[tokio::test]
    async fn bad_history_limit_uses_error_shape() {
        let (app, _) = app(false).await;
        for uri in ["/status/history?limit=-1", "/status/history?limit=abc"] {
            let (status, body) = call(&app, get(uri)).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(body["status"], "error");
            assert_eq!(body["code"], 422);
            assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
        }
    }

    #[tokio::test]
    async fn control_is_accepted_with_command_id() {
        let (app, bridge) = app(true).await;
        let (status, body) = call(
            &app,
            post("/control", r#"{"action":"start","parameters":{"profile":"hd"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "success");
        assert_eq!(body["command_sent"], true);
        assert_eq!(body["message"], "Command 'start' is being processed");
        assert!(body["command_id"].as_str().unwrap().starts_with("cmd_"));

        let (status, _) = call(&app, post("/control", r#"{"action":"fly"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        bridge.close().await;
        let (status, _) = call(&app, post("/control", r#"{"action":"stop"}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_and_metrics() {
        let (app, _) = app(true).await;
        let (status, body) = call(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_status"], "running");
        assert_eq!(body["mqtt_connected"], true);
        assert_eq!(body["connection_state"], "connected");
        assert_eq!(body["has_status_data"], false);
        assert!(body["last_status_time"].is_null());

        call(
            &app,
            post("/status", r#"{"timestamp":42,"fps":10.0,"saved_files":["a","b"]}"#),
        )
        .await;
        let (_, body) = call(&app, get("/health")).await;
        assert_eq!(body["last_status_time"], 42);

        let (status, body) = call(&app, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_metrics"]["file_count"], 2);
        assert_eq!(body["system_info"]["last_updated"], 42);

        let (_, body) = call(&app, get("/files")).await;
        assert_eq!(body["files"], json!(["a", "b"]));
        assert_eq!(body["last_updated"], "1970-01-01T00:00:42+00:00");

        let (_, body) = call(&app, get("/")).await;
        assert_eq!(body["status"], "running");
        assert!(body["endpoints"].as_array().unwrap().len() >= 5);
    }
}
