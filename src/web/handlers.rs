//! HTTP request handlers.

use super::AppState;
use crate::config::{ConfigError, RuntimeConfig};
use crate::db::{NewAttempt, Status};
use crate::manager::ManagerError;
use crate::probe::{run_probe, ProbeError};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Errors
// ============================================================================

fn error_response(e: ManagerError) -> Response {
    let status = match &e {
        ManagerError::Config(ConfigError::Missing | ConfigError::InvalidPort(_)) => StatusCode::BAD_REQUEST,
        ManagerError::Dial(d) if d.is_config_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", e);
    }
    (status, e.to_string()).into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Connection not found").into_response()
}

fn validate_target(target: &NewAttempt) -> Result<(), String> {
    if target.kind.trim().is_empty() {
        return Err("type is required".to_string());
    }
    if target.host.trim().is_empty() {
        return Err("host is required".to_string());
    }
    if target.port.trim().is_empty() {
        return Err("port is required".to_string());
    }
    Ok(())
}

// ============================================================================
// API: Connections
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn handle_get_connections(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let status = query.status.as_deref().map(Status::from);

    let result = match (&query.kind, &status) {
        (Some(kind), Some(status)) => state
            .manager
            .list_by_type(kind)
            .map(|all| all.into_iter().filter(|a| &a.status == status).collect()),
        (Some(kind), None) => state.manager.list_by_type(kind),
        (None, Some(status)) => state.manager.list_by_status(status),
        (None, None) => state.manager.list(),
    };

    match result {
        Ok(attempts) => Json(attempts).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_create_connection(
    State(state): State<AppState>,
    Json(req): Json<NewAttempt>,
) -> impl IntoResponse {
    if let Err(msg) = validate_target(&req) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    match state.manager.create(req) {
        Ok(attempt) => (StatusCode::CREATED, Json(attempt)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_create_batch(
    State(state): State<AppState>,
    Json(req): Json<Vec<NewAttempt>>,
) -> impl IntoResponse {
    for (i, target) in req.iter().enumerate() {
        if let Err(msg) = validate_target(target) {
            return (StatusCode::BAD_REQUEST, format!("record {}: {}", i + 1, msg)).into_response();
        }
    }

    match state.manager.create_batch(req) {
        Ok(attempts) => (StatusCode::CREATED, Json(attempts)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_get_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.get(&id) {
        Ok(Some(attempt)) => Json(attempt).into_response(),
        Ok(None) => not_found(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateConnectionRequest {
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

pub async fn handle_update_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateConnectionRequest>,
) -> impl IntoResponse {
    let mut attempt = match state.manager.get(&id) {
        Ok(Some(a)) => a,
        Ok(None) => return not_found(),
        Err(e) => return error_response(e),
    };

    attempt.status = req.status;
    attempt.message = req.message;
    attempt.result = req.result;
    attempt.logs = req.logs;
    attempt.connected_at = req.connected_at;

    match state.manager.update(&mut attempt) {
        Ok(true) => Json(attempt).into_response(),
        Ok(false) => not_found(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_update_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<NewAttempt>,
) -> impl IntoResponse {
    if let Err(msg) = validate_target(&req) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    match state.manager.update_info(&id, &req) {
        Ok(true) => match state.manager.get(&id) {
            Ok(Some(attempt)) => Json(attempt).into_response(),
            Ok(None) => not_found(),
            Err(e) => error_response(e),
        },
        Ok(false) => not_found(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_delete_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.delete(&id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteBatchRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteBatchResponse {
    pub requested: usize,
    pub deleted: usize,
}

pub async fn handle_delete_batch(
    State(state): State<AppState>,
    Json(req): Json<DeleteBatchRequest>,
) -> impl IntoResponse {
    match state.manager.delete_batch(&req.ids) {
        Ok(deleted) => Json(DeleteBatchResponse {
            requested: req.ids.len(),
            deleted,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_probe_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match run_probe(&state.manager, &id, &state.probe).await {
        Ok(attempt) => Json(attempt).into_response(),
        Err(ProbeError::NotFound(_)) => not_found(),
        Err(ProbeError::Manager(e)) => error_response(e),
    }
}

// ============================================================================
// API: Settings
// ============================================================================

pub async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.config().get() {
        Ok(cfg) => Json((*cfg).clone()).into_response(),
        Err(e) => error_response(e.into()),
    }
}

pub async fn handle_update_config(
    State(state): State<AppState>,
    Json(req): Json<Option<RuntimeConfig>>,
) -> impl IntoResponse {
    let cfg = match req {
        Some(cfg) => cfg,
        None => return error_response(ConfigError::Missing.into()),
    };

    if let Err(e) = cfg.clone().normalized().listen_port_number() {
        return error_response(e.into());
    }

    match state.manager.config().save(cfg) {
        Ok(saved) => Json((*saved).clone()).into_response(),
        Err(e) => error_response(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ConfigStore;
    use crate::db::{ConnectionAttempt, Store};
    use crate::manager::ConnectionManager;
    use crate::web::{DeleteBatchResponse, Server};

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn app() -> (TempDir, Router) {
        let dir = tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(dir.path().join("config.json")));
        let store = Store::new(dir.path().join("connections.db")).unwrap();
        let manager = Arc::new(ConnectionManager::new(config, store));
        (dir, Server::new(manager).routes())
    }

    fn request(method: Method, uri: &str, body: Option<&str>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer admin123")
            .header(header::CONTENT_TYPE, "application/json");
        builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_requires_password() {
        let (_dir, app) = app();
        let req = Request::builder()
            .uri("/api/connections")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_connection_lifecycle_over_http() {
        let (_dir, app) = app();

        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/connections",
                Some(r#"{"type":"ssh","host":"10.0.0.5","port":"22"}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let created: ConnectionAttempt = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.status.as_str(), "pending");

        let uri = format!("/api/connections/{}", created.id);
        let (status, body) = send(
            &app,
            request(Method::PUT, &uri, Some(r#"{"status":"success","logs":["connected"]}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let updated: ConnectionAttempt = serde_json::from_slice(&body).unwrap();
        assert!(updated.connected_at.is_some());

        let (status, body) = send(&app, request(Method::GET, &uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        let fetched: ConnectionAttempt = serde_json::from_slice(&body).unwrap();
        assert_eq!(fetched.logs, vec!["connected"]);

        let (status, _) = send(&app, request(Method::DELETE, &uri, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, request(Method::DELETE, &uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_create_filter_and_delete() {
        let (_dir, app) = app();

        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/connections/batch",
                Some(
                    r#"[{"type":"ssh","host":"a","port":"22"},
                        {"type":"rdp","host":"b","port":"3389","user":"admin","pass":"x"}]"#,
                ),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let created: Vec<ConnectionAttempt> = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.len(), 2);

        let (_, body) = send(&app, request(Method::GET, "/api/connections?type=ssh", None)).await;
        let listed: Vec<ConnectionAttempt> = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, "ssh");

        let payload = format!(r#"{{"ids":["{}","ghost"]}}"#, created[0].id);
        let (status, body) = send(&app, request(Method::POST, "/api/connections/delete", Some(&payload))).await;
        assert_eq!(status, StatusCode::OK);
        let resp: DeleteBatchResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.requested, 2);
        assert_eq!(resp.deleted, 1);
    }

    #[tokio::test]
    async fn test_batch_create_validates_records() {
        let (_dir, app) = app();
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/connections/batch",
                Some(r#"[{"type":"ssh","host":"a","port":"22"},{"type":"ssh","host":"","port":"22"}]"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(String::from_utf8(body).unwrap(), "record 2: host is required");

        let (_, body) = send(&app, request(Method::GET, "/api/connections", None)).await;
        let listed: Vec<ConnectionAttempt> = serde_json::from_slice(&body).unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let (_dir, app) = app();

        let (status, _) = send(&app, request(Method::PUT, "/api/config", Some("null"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            request(
                Method::PUT,
                "/api/config",
                Some(r#"{"password":"","port":"","proxy":{"enabled":true,"type":"","host":"127.0.0.1","port":"1080"}}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let saved: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(saved["port"], "18921");
        assert_eq!(saved["proxy"]["type"], "socks5");

        let (status, _) = send(
            &app,
            request(Method::PUT, "/api/config", Some(r#"{"port":"not-a-port"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_probe_unknown_connection() {
        let (_dir, app) = app();
        let (status, _) = send(&app, request(Method::POST, "/api/connections/nope/probe", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
