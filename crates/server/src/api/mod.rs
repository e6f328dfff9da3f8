use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use flowrun_core::{workflow::ExecutionController, EngineError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server and the worker pool
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;
    let controller = state.controller.clone();

    let mut events = state.notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(
                    run_id = %event.run_id,
                    tenant = %event.tenant_id,
                    "Status change: {:?}",
                    event.event_type
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Status change log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let workers = controller.spawn_workers();
    recover(&controller).await?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller.shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Bring back tenants recorded by earlier processes and resume their runs
async fn recover(controller: &ExecutionController) -> Result<()> {
    controller.restore_tenants().await?;
    for tenant in controller.tenants().list_tenants() {
        controller.recover_tenant(&tenant.id).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/tenants",
            get(handlers::list_tenants).post(handlers::create_tenant),
        )
        .route(
            "/api/tenants/{tenant_id}/suspend",
            post(handlers::suspend_tenant),
        )
        .route(
            "/api/tenants/{tenant_id}/activate",
            post(handlers::activate_tenant),
        )
        .route("/api/flows", put(handlers::save_flow))
        .route("/api/flows/{flow_id}", get(handlers::get_flow))
        .route("/api/flows/{flow_id}/runs", post(handlers::start_run))
        .route("/api/runs", get(handlers::list_runs))
        .route("/api/runs/stats", get(handlers::run_stats))
        .route(
            "/api/runs/{run_id}",
            get(handlers::get_run).delete(handlers::delete_run),
        )
        .route("/api/runs/{run_id}/pause", post(handlers::pause_run))
        .route("/api/runs/{run_id}/resume", post(handlers::resume_run))
        .route("/api/runs/{run_id}/stop", post(handlers::stop_run))
        .route("/api/runs/{run_id}/restart", post(handlers::restart_run))
        .route(
            "/api/runs/{run_id}/nodes/{node_id}/complete",
            post(handlers::complete_node),
        )
        .route("/api/runs/{run_id}/logs", get(handlers::run_logs))
        .route("/api/queue", get(handlers::queue_stats))
        .route("/api/metrics", get(handlers::metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "flowrun",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error type for API handlers. Engine errors map to their status code,
/// transient failures to 503 and anything else to 500.
pub struct ApiError {
    error: anyhow::Error,
    status: Option<StatusCode>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            error: anyhow::anyhow!(message.into()),
            status: Some(StatusCode::BAD_REQUEST),
        }
    }

    pub fn status(&self) -> StatusCode {
        if let Some(status) = self.status {
            return status;
        }

        match self.error.downcast_ref::<EngineError>() {
            Some(EngineError::UnknownTenant(_))
            | Some(EngineError::FlowNotFound(_))
            | Some(EngineError::RunNotFound(_)) => StatusCode::NOT_FOUND,
            Some(EngineError::InvalidTransition { .. })
            | Some(EngineError::DuplicateJob { .. })
            | Some(EngineError::TenantExists(_)) => StatusCode::CONFLICT,
            Some(EngineError::InvalidFlow(_)) => StatusCode::BAD_REQUEST,
            Some(EngineError::TenantSuspended(_)) => StatusCode::FORBIDDEN,
            Some(EngineError::QuotaExceeded(_)) => StatusCode::TOO_MANY_REQUESTS,
            Some(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the request itself was at fault
    fn is_client_error(&self) -> bool {
        match self.error.downcast_ref::<EngineError>() {
            Some(err) => err.is_caller_error(),
            None => self.status.is_some_and(|s| s.is_client_error()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        if self.is_client_error() {
            tracing::debug!(status = %status, "Request rejected: {}", error_msg);
        } else {
            tracing::error!(status = %status, "Request failed: {:#}", self.error);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            error: err.into(),
            status: None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use flowrun_core::tenant::TenantId;
    use flowrun_core::RunId;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let state = AppState::new(&config).unwrap();
        state.controller.spawn_workers();
        (dir, state)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, tenant: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(tenant) = tenant {
            builder = builder.header("X-Tenant-Id", tenant);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EngineError::UnknownTenant(TenantId::new("x")), StatusCode::NOT_FOUND),
            (EngineError::RunNotFound(RunId::new()), StatusCode::NOT_FOUND),
            (
                EngineError::invalid_transition("completed", "paused"),
                StatusCode::CONFLICT,
            ),
            (EngineError::InvalidFlow("cycle".into()), StatusCode::BAD_REQUEST),
            (EngineError::QuotaExceeded("full".into()), StatusCode::TOO_MANY_REQUESTS),
            (
                EngineError::Storage(anyhow::anyhow!("disk full")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::PermanentFailure("bad state".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status(), expected);
        }
        assert_eq!(ApiError::bad_request("nope").status(), StatusCode::BAD_REQUEST);

        assert!(ApiError::from(EngineError::RunNotFound(RunId::new())).is_client_error());
        assert!(!ApiError::from(EngineError::CancellationRequested).is_client_error());
        assert!(ApiError::bad_request("nope").is_client_error());
        assert!(!ApiError::from(anyhow::anyhow!("boom")).is_client_error());
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = test_state();
        let app = create_router(state);

        let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_flow_and_run_lifecycle() {
        let (_dir, state) = test_state();
        let app = create_router(state);

        let (status, _) = send(
            &app,
            json_request("POST", "/api/tenants", None, json!({ "id": "acme", "name": "Acme" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, flow) = send(
            &app,
            json_request(
                "PUT",
                "/api/flows",
                Some("acme"),
                json!({
                    "id": "greet",
                    "name": "Greeting",
                    "nodes": [
                        { "id": "hello", "action": "core.set", "config": { "value": "hi" } },
                        { "id": "echo", "action": "core.echo", "inputs": { "greeting": "hello" } }
                    ],
                    "edges": [{ "source": "hello", "target": "echo" }]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flow["version"], 1);

        let (status, run) = send(
            &app,
            json_request("POST", "/api/flows/greet/runs", Some("acme"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = run["id"].as_str().unwrap().to_string();

        let mut finished = Value::Null;
        for _ in 0..200 {
            let request = Request::builder()
                .uri(format!("/api/runs/{}", run_id))
                .header("X-Tenant-Id", "acme")
                .body(Body::empty())
                .unwrap();
            let (status, body) = send(&app, request).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == "completed" {
                finished = body;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(finished["status"], "completed");

        // Another tenant cannot see the run
        let request = Request::builder()
            .uri(format!("/api/runs/{}", run_id))
            .header("X-Tenant-Id", "globex")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Finished runs cannot be paused
        let (status, body) = send(
            &app,
            json_request("POST", &format!("/api/runs/{}/pause", run_id), Some("acme"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("invalid transition"));
    }

    fn find_node<'a>(run: &'a Value, node_id: &str) -> &'a Value {
        run["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|n| n["node_id"] == node_id)
            .unwrap()
    }

    async fn poll_run<F>(app: &Router, run_id: &str, done: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        for _ in 0..200 {
            let request = Request::builder()
                .uri(format!("/api/runs/{}", run_id))
                .header("X-Tenant-Id", "acme")
                .body(Body::empty())
                .unwrap();
            let (_, body) = send(app, request).await;
            if done(&body) {
                return body;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run {} never reached the expected state", run_id);
    }

    #[tokio::test]
    async fn test_complete_waiting_node() {
        let (_dir, state) = test_state();
        let app = create_router(state);
        send(
            &app,
            json_request("POST", "/api/tenants", None, json!({ "id": "acme", "name": "Acme" })),
        )
        .await;
        send(
            &app,
            json_request(
                "PUT",
                "/api/flows",
                Some("acme"),
                json!({
                    "id": "release",
                    "name": "Release",
                    "nodes": [
                        { "id": "approve", "action": "core.wait" },
                        { "id": "ship", "action": "core.echo", "inputs": { "approval": "approve" } }
                    ],
                    "edges": [{ "source": "approve", "target": "ship" }]
                }),
            ),
        )
        .await;

        let (_, run) = send(
            &app,
            json_request("POST", "/api/flows/release/runs", Some("acme"), json!({})),
        )
        .await;
        let run_id = run["id"].as_str().unwrap().to_string();
        poll_run(&app, &run_id, |run| find_node(run, "approve")["parked"] == true).await;

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                &format!("/api/runs/{}/nodes/ship/complete", run_id),
                Some("acme"),
                json!({ "type": "success", "result": 1 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                &format!("/api/runs/{}/nodes/approve/complete", run_id),
                Some("acme"),
                json!({ "type": "success", "result": { "by": "ops" } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let finished = poll_run(&app, &run_id, |run| run["status"] == "completed").await;
        assert_eq!(find_node(&finished, "ship")["result"], json!({ "approval": { "by": "ops" } }));
    }

    #[tokio::test]
    async fn test_api_tenants_and_runs_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };

        // First process accepts the run but has no workers to execute it
        let run_id = {
            let app = create_router(AppState::new(&config).unwrap());
            let (status, _) = send(
                &app,
                json_request("POST", "/api/tenants", None, json!({ "id": "acme", "name": "Acme" })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            send(
                &app,
                json_request(
                    "PUT",
                    "/api/flows",
                    Some("acme"),
                    json!({
                        "id": "hello",
                        "name": "Hello",
                        "nodes": [{ "id": "a", "action": "core.set", "config": { "value": 1 } }]
                    }),
                ),
            )
            .await;
            let (status, run) = send(
                &app,
                json_request("POST", "/api/flows/hello/runs", Some("acme"), json!({})),
            )
            .await;
            assert_eq!(status, StatusCode::ACCEPTED);
            run["id"].as_str().unwrap().to_string()
        };

        let state = AppState::new(&config).unwrap();
        state.controller.spawn_workers();
        recover(&state.controller).await.unwrap();
        let app = create_router(state);

        let request = Request::builder().uri("/api/tenants").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenants"][0]["id"], "acme");

        let finished = poll_run(&app, &run_id, |run| run["status"] == "completed").await;
        assert_eq!(find_node(&finished, "a")["result"], 1);
    }

    #[tokio::test]
    async fn test_suspended_tenant_cannot_start_runs() {
        let (_dir, state) = test_state();
        let app = create_router(state);
        send(
            &app,
            json_request("POST", "/api/tenants", None, json!({ "id": "acme", "name": "Acme" })),
        )
        .await;
        send(
            &app,
            json_request(
                "PUT",
                "/api/flows",
                Some("acme"),
                json!({ "id": "noop", "name": "Noop", "nodes": [] }),
            ),
        )
        .await;

        let (status, tenant) = send(
            &app,
            json_request("POST", "/api/tenants/acme/suspend", None, json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tenant["status"], "suspended");

        let (status, _) = send(
            &app,
            json_request("POST", "/api/flows/noop/runs", Some("acme"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        send(
            &app,
            json_request("POST", "/api/tenants/acme/activate", None, json!({})),
        )
        .await;
        let (status, _) = send(
            &app,
            json_request("POST", "/api/flows/noop/runs", Some("acme"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_requests_need_tenant_header() {
        let (_dir, state) = test_state();
        let app = create_router(state);

        let request = Request::builder().uri("/api/runs").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("X-Tenant-Id"));
    }

    #[tokio::test]
    async fn test_invalid_flow_is_bad_request() {
        let (_dir, state) = test_state();
        let app = create_router(state);
        send(
            &app,
            json_request("POST", "/api/tenants", None, json!({ "id": "acme", "name": "Acme" })),
        )
        .await;

        let (status, _) = send(
            &app,
            json_request(
                "PUT",
                "/api/flows",
                Some("acme"),
                json!({
                    "id": "loop",
                    "name": "Loop",
                    "nodes": [
                        { "id": "a", "action": "core.echo" },
                        { "id": "b", "action": "core.echo" }
                    ],
                    "edges": [
                        { "source": "a", "target": "b" },
                        { "source": "b", "target": "a" }
                    ]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
