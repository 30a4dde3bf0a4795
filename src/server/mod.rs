//! HTTP start trigger.
//!
//! `POST /run` checks the caller's secret and, when it matches, launches an
//! independent chain in the background and acknowledges straight away. The
//! chain's outcome is only visible in the logs and the audit trail.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::chain::{ChainOrchestrator, Collaborators, Credentials, RetryPolicy};

/// Starts chains on behalf of the server.
pub trait ChainLauncher: Send + Sync {
    /// Begin a chain in the background and return its run id without waiting.
    fn launch(&self, start_url: String, credentials: Credentials) -> Uuid;
}

/// Spawns one `ChainOrchestrator` per request on the tokio runtime.
pub struct OrchestratorLauncher {
    collaborators: Collaborators,
    policy: RetryPolicy,
    audit_dir: Option<PathBuf>,
}

impl OrchestratorLauncher {
    pub fn new(collaborators: Collaborators, policy: RetryPolicy, audit_dir: Option<PathBuf>) -> Self {
        Self {
            collaborators,
            policy,
            audit_dir,
        }
    }
}

impl ChainLauncher for OrchestratorLauncher {
    fn launch(&self, start_url: String, credentials: Credentials) -> Uuid {
        let mut orchestrator =
            ChainOrchestrator::new(self.collaborators.clone(), credentials, self.policy);
        if let Some(dir) = &self.audit_dir {
            orchestrator = orchestrator.with_audit(AuditLogger::new(dir));
        }
        let run_id = orchestrator.run_id();
        tokio::spawn(async move {
            let report = orchestrator.run(&start_url).await;
            info!(
                run_id = %report.run_id,
                state = %report.state,
                links_solved = report.links_solved.len(),
                "chain finished"
            );
        });
        run_id
    }
}

pub struct AppState {
    pub expected_secret: String,
    pub launcher: Arc<dyn ChainLauncher>,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub email: String,
    pub secret: String,
    #[serde(alias = "startUrl")]
    pub url: String,
    /// Anything else the caller sends is accepted and ignored.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub message: String,
    pub status: String,
    pub run_id: Uuid,
}

pub enum ApiError {
    Forbidden(String),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/run", post(start_run))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn start_run(
    State(state): State<SharedState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunAccepted>, ApiError> {
    if request.secret != state.expected_secret {
        warn!(email = %request.email, "rejected start request with invalid secret");
        return Err(ApiError::Forbidden("Invalid secret".to_string()));
    }
    if reqwest::Url::parse(&request.url).is_err() {
        return Err(ApiError::BadRequest(format!("'{}' is not an absolute URL", request.url)));
    }
    if !request.extra.is_empty() {
        let keys: Vec<&str> = request.extra.keys().map(String::as_str).collect();
        info!(?keys, "ignoring extra request fields");
    }

    let run_id = state.launcher.launch(
        request.url.clone(),
        Credentials {
            email: request.email,
            secret: request.secret,
        },
    );
    info!(%run_id, url = %request.url, "chain dispatched");

    Ok(Json(RunAccepted {
        message: "Quiz processing started".to_string(),
        status: "ok".to_string(),
        run_id,
    }))
}

/// Bind and serve until Ctrl+C.
pub async fn serve(host: &str, port: u16, state: SharedState) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "start trigger listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(String, Credentials)>>,
    }

    impl ChainLauncher for RecordingLauncher {
        fn launch(&self, start_url: String, credentials: Credentials) -> Uuid {
            self.launched.lock().unwrap().push((start_url, credentials));
            Uuid::new_v4()
        }
    }

    fn test_app() -> (Router, Arc<RecordingLauncher>) {
        let launcher = Arc::new(RecordingLauncher::default());
        let state = Arc::new(AppState {
            expected_secret: "s3cret".to_string(),
            launcher: launcher.clone(),
        });
        (build_router(state), launcher)
    }

    fn post_run(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/run")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(body: Body) -> Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await, json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn test_matching_secret_launches_and_acknowledges() {
        let (app, launcher) = test_app();
        let response = app
            .oneshot(post_run(json!({
                "email": "a@example.com",
                "secret": "s3cret",
                "url": "https://quiz.example.com/demo",
                "note": "extra fields are fine"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response.into_body()).await;
        assert_eq!(body["message"], "Quiz processing started");
        assert_eq!(body["status"], "ok");
        assert!(body["run_id"].as_str().is_some());

        let launched = launcher.launched.lock().unwrap();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].0, "https://quiz.example.com/demo");
        assert_eq!(launched[0].1.email, "a@example.com");
        assert_eq!(launched[0].1.secret, "s3cret");
    }

    #[tokio::test]
    async fn test_start_url_alias_is_accepted() {
        let (app, launcher) = test_app();
        let response = app
            .oneshot(post_run(json!({
                "email": "a@example.com",
                "secret": "s3cret",
                "startUrl": "https://quiz.example.com/demo"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_forbidden_and_does_nothing() {
        let (app, launcher) = test_app();
        let response = app
            .oneshot(post_run(json!({
                "email": "a@example.com",
                "secret": "guess",
                "url": "https://quiz.example.com/demo"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response.into_body()).await,
            json!({"error": "Invalid secret"})
        );
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected() {
        let (app, launcher) = test_app();
        let response = app
            .oneshot(post_run(json!({"secret": "s3cret"})))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relative_url_is_bad_request() {
        let (app, launcher) = test_app();
        let response = app
            .oneshot(post_run(json!({
                "email": "a@example.com",
                "secret": "s3cret",
                "url": "/demo"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(launcher.launched.lock().unwrap().is_empty());
    }
}
