use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/info", get(info))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/database", get(database))
}

#[derive(Serialize)]
struct CompatHealthResponse {
    database: &'static str,
    timestamp: String,
    status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthInfoResponse {
    service: &'static str,
    version: String,
    environment: String,
    start_time: String,
    uptime: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LivenessResponse {
    status: &'static str,
    timestamp: String,
    uptime: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseHealthResponse {
    healthy: bool,
    latency_ms: Option<u64>,
    error: Option<String>,
    consecutive_failures: u32,
}

async fn root(State(state): State<AppState>) -> Response {
    let connected = database_connected(&state).await;

    let response = CompatHealthResponse {
        database: if connected { "connected" } else { "disconnected" },
        timestamp: now_iso(),
        status: if connected { "ok" } else { "degraded" },
    };

    let status_code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response)).into_response()
}

async fn info(State(state): State<AppState>) -> Response {
    let response = HealthInfoResponse {
        service: "aula-backend",
        version: std::env::var("APP_VERSION")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        environment: std::env::var("NODE_ENV")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "development".to_string()),
        start_time: system_time_iso(state.started_at_system()),
        uptime: state.uptime_seconds(),
    };

    Json(response).into_response()
}

async fn live(State(state): State<AppState>) -> Response {
    Json(LivenessResponse {
        status: "healthy",
        timestamp: now_iso(),
        uptime: state.uptime_seconds(),
    })
    .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    if database_connected(&state).await {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false })),
        )
            .into_response()
    }
}

async fn database(State(state): State<AppState>) -> Response {
    let Some(proxy) = state.db_proxy() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(DatabaseHealthResponse {
                healthy: false,
                latency_ms: None,
                error: Some("database proxy not initialized".to_string()),
                consecutive_failures: 0,
            }),
        )
            .into_response();
    };

    let snapshot = proxy.health_status().await;
    let status_code = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(DatabaseHealthResponse {
            healthy: snapshot.healthy,
            latency_ms: snapshot.latency_ms,
            error: snapshot.error,
            consecutive_failures: snapshot.consecutive_failures,
        }),
    )
        .into_response()
}

async fn database_connected(state: &AppState) -> bool {
    match state.db_proxy() {
        Some(proxy) => proxy.health_status().await.healthy,
        None => false,
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn system_time_iso(time: std::time::SystemTime) -> String {
    let datetime: chrono::DateTime<Utc> = time.into();
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}
