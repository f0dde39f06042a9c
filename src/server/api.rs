//! REST API handlers for the status server

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::distribution::{DistributionError, SupervisorState};
use crate::metrics;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub group: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub node_id: String,
    pub group: String,
    pub count: usize,
    pub nodes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct OwnerResponse {
    pub key: String,
    pub owner: String,
    pub is_owner: bool,
}

#[derive(Debug, Serialize)]
pub struct SupervisorResponse {
    pub name: String,
    pub state: SupervisorState,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/nodes", get(list_nodes))
        .route("/api/owner/{key}", get(get_owner))
        .route("/api/supervisors/{name}", get(get_supervisor))
        .route("/metrics", get(get_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_default();
    let start = Instant::now();

    let response = next.run(request).await;
    metrics::record_api_request(
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    let (code, status) = if node.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(ApiResponse::success(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_id: node.node_id().to_string(),
            group: node.group().to_string(),
            started_at: state.started_at,
            uptime_secs: state.start_time.elapsed().as_secs(),
        })),
    )
}

async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.node.nodes();
    Json(ApiResponse::success(NodesResponse {
        node_id: state.node.node_id().to_string(),
        group: state.node.group().to_string(),
        count: nodes.len(),
        nodes,
    }))
}

async fn get_owner(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.node.node_for(&key) {
        Ok(owner) => {
            let is_owner = owner == state.node.node_id();
            Json(ApiResponse::success(OwnerResponse { key, owner, is_owner })).into_response()
        }
        Err(err @ DistributionError::NoNodes) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<OwnerResponse>::error(err.to_string())),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<OwnerResponse>::error(err.to_string())),
        )
            .into_response(),
    }
}

async fn get_supervisor(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.node.supervisor_state(&name) {
        Some(supervisor_state) => Json(ApiResponse::success(SupervisorResponse {
            name,
            state: supervisor_state,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<SupervisorResponse>::error(format!(
                "supervisor \"{name}\" not found"
            ))),
        )
            .into_response(),
    }
}

async fn get_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{ExecutorConfig, Node, NodeConfig};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> (MemoryStore, AppState) {
        let store = MemoryStore::new();
        let config = NodeConfig::builder()
            .events_group_interval(Duration::ZERO)
            .build()
            .unwrap();
        let node = Node::new("api-node", Arc::new(store.client()), config)
            .await
            .unwrap();
        (store, AppState::new(Arc::new(node)))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(HttpRequest::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_store, state) = test_state().await;
        let (status, body) = get_json(create_router(state.clone()), "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["node_id"], "api-node");
        assert_eq!(body["data"]["group"], "default");
        assert!(body["data"]["started_at"].is_string());

        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_nodes() {
        let (_store, state) = test_state().await;
        let (status, body) = get_json(create_router(state.clone()), "/api/nodes").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 1);
        assert_eq!(body["data"]["nodes"][0], "api-node");

        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_owner() {
        let (_store, state) = test_state().await;
        let (status, body) = get_json(create_router(state.clone()), "/api/owner/job-42").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["key"], "job-42");
        assert_eq!(body["data"]["owner"], "api-node");
        assert_eq!(body["data"]["is_owner"], true);

        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_supervisor() {
        let (_store, state) = test_state().await;
        state
            .node
            .start_executor("jobs", ExecutorConfig::default(), |_ctx| async { Ok(()) })
            .await
            .unwrap();

        let (status, body) =
            get_json(create_router(state.clone()), "/api/supervisors/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "running");

        let (status, body) =
            get_json(create_router(state.clone()), "/api/supervisors/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        state.node.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_after_shutdown() {
        let (_store, state) = test_state().await;
        state.node.shutdown().await;

        let (status, body) = get_json(create_router(state), "/api/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["data"]["status"], "shutting_down");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let _ = metrics::init_metrics();
        let (_store, state) = test_state().await;

        let response = create_router(state.clone())
            .oneshot(HttpRequest::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("fleetdist_nodes"));

        state.node.shutdown().await;
    }
}
