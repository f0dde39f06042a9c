//! Status API of a node
//!
//! A small HTTP server exposing the node's view of its group: the known
//! members, the owner of a key, the state of its supervisors and the
//! Prometheus metrics.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerSettings;
use crate::distribution::Node;

pub use api::{create_router, ApiResponse};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Node answering the queries
    pub node: Arc<Node>,

    /// Server start time
    pub start_time: Instant,

    /// Wall-clock start time, reported by the health check
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

/// Server errors
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind: {0}")]
    Bind(String),

    #[error("Server error: {0}")]
    Serve(String),
}

/// HTTP server for the status API
pub struct StatusServer {
    bind_address: SocketAddr,
    enable_cors: bool,
    state: AppState,
}

impl StatusServer {
    pub fn new(node: Arc<Node>, settings: &ServerSettings) -> Result<Self, ServerError> {
        let bind_address = settings.bind_address.parse().map_err(|e| {
            ServerError::Config(format!("invalid bind address '{}': {e}", settings.bind_address))
        })?;

        Ok(Self {
            bind_address,
            enable_cors: settings.enable_cors,
            state: AppState::new(node),
        })
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Build the router with all routes and layers
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Serve until the shutdown signal resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(self.bind_address)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        tracing::info!(address = %self.bind_address, "status API listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        tracing::info!("status API stopped");
        Ok(())
    }
}
