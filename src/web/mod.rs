//! Web server module.

mod handlers;

pub use handlers::*;

use crate::manager::ConnectionManager;
use crate::probe::ProbeConfig;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub probe: ProbeConfig,
}

/// Web server for batch-connector.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            state: AppState {
                manager,
                probe: ProbeConfig::default(),
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Attempts
            .route("/api/connections", get(handlers::handle_get_connections))
            .route("/api/connections", post(handlers::handle_create_connection))
            .route("/api/connections/batch", post(handlers::handle_create_batch))
            .route("/api/connections/delete", post(handlers::handle_delete_batch))
            .route("/api/connections/{id}", get(handlers::handle_get_connection))
            .route("/api/connections/{id}", put(handlers::handle_update_connection))
            .route("/api/connections/{id}", delete(handlers::handle_delete_connection))
            .route("/api/connections/{id}/info", put(handlers::handle_update_info))
            .route("/api/connections/{id}/probe", post(handlers::handle_probe_connection))
            // Settings
            .route("/api/config", get(handlers::handle_get_config))
            .route("/api/config", put(handlers::handle_update_config))
            .layer(middleware::from_fn_with_state(self.state.clone(), require_password))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(8 * 1024 * 1024)) // 8MB, large CSV imports
            .with_state(self.state.clone())
    }

    /// Start the server on the configured listen port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let port = self.state.manager.config().get()?.listen_port_number()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

/// Reject requests without `Authorization: Bearer <password>`.
///
/// The password is read from the live config, so a saved change applies to
/// the next request.
async fn require_password(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let cfg = match state.manager.config().get() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Failed to read config for auth: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| password_matches(token, &cfg.password))
        .unwrap_or(false);

    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(req).await
}

/// Compare without an early exit on the first differing byte.
fn password_matches(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    if given.len() != expected.len() {
        return false;
    }
    given
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
