//! REST control surface and dashboard read access
//!
//! Two idempotent triggers start and stop the cycle loop; the remaining
//! routes expose sessions, cycle logs, and the latest cycle state for an
//! external dashboard process.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::worker::AgentController;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<AgentController>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Control Triggers
/// =============================

async fn start_agent(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.controller.start().await {
        Ok(session) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "status": "started",
                "session_id": session.id,
            }))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Failed to start agent: {}", e))),
        ),
    }
}

async fn stop_agent(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.controller.stop().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                serde_json::json!({ "status": "stopped" }),
            )),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Failed to stop agent: {}", e))),
        ),
    }
}

/// =============================
/// Dashboard Reads
/// =============================

async fn agent_state(State(state): State<ApiState>) -> Json<ApiResponse> {
    let last_state = state.controller.last_state().await;
    Json(ApiResponse::success(serde_json::json!({
        "running": state.controller.is_running(),
        "state": last_state,
    })))
}

async fn active_session(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.controller.store().active_session().await {
        Ok(Some(session)) => (StatusCode::OK, Json(ApiResponse::success(session))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("No active session".to_string())),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let Ok(session_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Invalid session id: {}", id))),
        );
    };

    match state.controller.store().get_session(session_id).await {
        Ok(Some(session)) => (StatusCode::OK, Json(ApiResponse::success(session))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Session not found: {}", id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn list_session_cycles(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let Ok(session_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Invalid session id: {}", id))),
        );
    };

    match state.controller.store().list_cycles(session_id).await {
        Ok(cycles) => (StatusCode::OK, Json(ApiResponse::success(cycles))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

async fn get_cycle(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let Ok(cycle_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Invalid cycle id: {}", id))),
        );
    };

    match state.controller.store().get_cycle(cycle_id).await {
        Ok(Some(cycle)) => (StatusCode::OK, Json(ApiResponse::success(cycle))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Cycle not found: {}", id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(controller: Arc<AgentController>) -> Router {
    let state = ApiState { controller };

    Router::new()
        .route("/health", get(health))
        .route("/agent/start", post(start_agent))
        .route("/agent/stop", post(stop_agent))
        .route("/agent/state", get(agent_state))
        .route("/sessions/active", get(active_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/cycles", get(list_session_cycles))
        .route("/cycles/:id", get(get_cycle))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    controller: Arc<AgentController>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(controller);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_response_wraps_success_and_error() {
        let ok = ApiResponse::success(serde_json::json!({ "status": "started" }));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let err = ApiResponse::error("boom".to_string());
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
    }
}
