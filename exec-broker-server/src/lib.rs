use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use exec_broker::{ExecConfig, ExecutionResult, InvocationKind, Outcome, Scheduler};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Largest request body accepted, source and stdin included
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing required fields: code and language.")]
    MissingFields,
    #[error("Unsupported language.")]
    UnsupportedLanguage(String),
    #[error("Execution not supported for this language.")]
    ExecutionNotSupported(String),
    #[error("Server busy, retry later.")]
    Busy { running: usize, queued: usize },
    /// The program ran (or tried to) and did not succeed
    #[error("{}", failure_message(.0.outcome))]
    ExecutionFailed(ExecutionResult),
    #[error("Execution error: {0}")]
    ExecutionError(exec_broker::Error),
    #[error("Server error: {0}")]
    ServerError(String),
}

fn failure_message(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::CompileError | Outcome::RuntimeError => "Compilation/Runtime Error",
        Outcome::Timeout => "Execution timed out.",
        Outcome::ResourceExceeded => "Resource limit exceeded.",
        Outcome::Cancelled => "Execution cancelled.",
        Outcome::InternalError => "Internal server error",
        Outcome::Success => "Execution succeeded.",
    }
}

impl From<exec_broker::Error> for ServerError {
    fn from(err: exec_broker::Error) -> Self {
        use exec_broker::Error;
        match err {
            Error::UnsupportedLanguage(id) => ServerError::UnsupportedLanguage(id),
            Error::LanguageDisabled(id) | Error::NotExecutable(id) | Error::EmptySource(id) => {
                ServerError::ExecutionNotSupported(id)
            }
            Error::AdmissionRejected { running, queued } => ServerError::Busy { running, queued },
            other => ServerError::ExecutionError(other),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, body) = match self {
            ServerError::MissingFields
            | ServerError::UnsupportedLanguage(_)
            | ServerError::ExecutionNotSupported(_) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            ServerError::Busy { running, queued } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": message, "running": running, "queued": queued }),
            ),
            ServerError::ExecutionFailed(result) => {
                let status = match result.outcome {
                    Outcome::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_REQUEST,
                };
                (
                    status,
                    json!({
                        "error": message,
                        "details": result.stderr,
                        "outcome": result.outcome,
                        "execution_id": result.id,
                    }),
                )
            }
            ServerError::ExecutionError(err) => {
                error!("Execution failed: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": err.to_string() }),
                )
            }
            ServerError::ServerError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal server error" }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

/// Body of `POST /`. Fields are optional so a missing one is answered with
/// the service's own 400 rather than a deserialization rejection.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExecuteRequest {
    pub content: Option<String>,
    pub language: Option<String>,
    pub stdin: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub execution_id: Uuid,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            stdout: result.stdout,
            stderr: result.stderr,
            execution_id: result.id,
            outcome: result.outcome,
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
            advisory: result.advisory,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub id: String,
    pub kind: InvocationKind,
    pub enabled: bool,
    pub available: bool,
}

#[derive(Clone)]
pub struct AppState {
    scheduler: Arc<Scheduler>,
}

pub fn create_app(config: ExecConfig) -> Result<Router, ServerError> {
    let scheduler = Scheduler::new(config).map_err(ServerError::ExecutionError)?;
    Ok(app_with_scheduler(scheduler))
}

/// Router over an already built scheduler
pub fn app_with_scheduler(scheduler: Scheduler) -> Router {
    let state = AppState {
        scheduler: Arc::new(scheduler),
    };

    let cors = CorsLayer::permissive();

    Router::new()
        .route("/", post(execute))
        .route("/execute", post(execute))
        .route("/health", get(health_check))
        .route("/languages", get(list_languages))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(app: Router, addr: SocketAddr) -> Result<(), ServerError> {
    info!("Starting execution broker on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, draining in-flight requests");
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Service is healthy.",
        "available_slots": state.scheduler.available_slots(),
    }))
}

async fn list_languages(State(state): State<AppState>) -> Json<Vec<LanguageInfo>> {
    let languages = state
        .scheduler
        .registry()
        .languages()
        .into_iter()
        .map(|descriptor| LanguageInfo {
            id: descriptor.id.clone(),
            kind: descriptor.kind,
            enabled: descriptor.enabled,
            available: descriptor.toolchain_available(),
        })
        .collect();
    Json(languages)
}

async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Response, ServerError> {
    let (Some(content), Some(language)) = (payload.content, payload.language) else {
        return Err(ServerError::MissingFields);
    };
    if language.trim().is_empty() {
        return Err(ServerError::MissingFields);
    }

    let descriptor = state.scheduler.registry().lookup(&language)?;
    if descriptor.kind == InvocationKind::Markup {
        return Ok(Json(json!({
            "stdout": "HTML content received.",
            "stderr": "",
            "html": content,
        }))
        .into_response());
    }

    let result = state
        .scheduler
        .submit_execution(
            content,
            &language,
            payload.stdin.map(String::into_bytes),
            payload.timeout_ms.map(Duration::from_millis),
        )
        .await?;

    if !result.outcome.is_success() {
        return Err(ServerError::ExecutionFailed(result));
    }
    Ok(Json(ExecuteResponse::from(result)).into_response())
}
