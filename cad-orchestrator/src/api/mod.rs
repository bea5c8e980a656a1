//! REST API for the CAD pipeline

use crate::pipeline::{CadPipeline, PipelineResult};
use axum::{
    body::Bytes,
    extract::State,
    handler::HandlerWithoutStateExt,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// API state
pub struct ApiState {
    pub pipeline: Arc<CadPipeline>,
}

/// Request to generate a model from text
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
}

/// Request to run a caller-supplied script
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(rename = "pythonCode", default)]
    pub python_code: String,
}

/// Failure body for requests that never reached the pipeline
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub fallback_available: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub available_modules: Vec<String>,
    pub version: String,
    pub llm_configured: bool,
}

/// Create the API router. Paths that match no route are served from
/// `static_dir`.
pub fn create_router(state: Arc<ApiState>, static_dir: &Path) -> Router {
    let static_files = ServeDir::new(static_dir).not_found_service(file_not_found.into_service());

    Router::new()
        .route("/health", get(health_check))
        .route("/api/generate", post(generate))
        .route("/api/execute", post(execute))
        .fallback_service(static_files)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let available_modules = state.pipeline.executor().runner().available_modules().await;
    let message = if available_modules.iter().any(|m| m == "cadquery") {
        "CAD service is running"
    } else {
        "CAD service is running (CadQuery unavailable, serving fallback previews)"
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        message: message.to_string(),
        available_modules,
        version: env!("CARGO_PKG_VERSION").to_string(),
        llm_configured: state.pipeline.llm_configured(),
    })
}

/// Text prompt -> model
async fn generate(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let request: GenerateRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };

    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return error_response("No prompt provided".to_string());
    }

    info!(prompt_len = prompt.len(), "Generate request");
    pipeline_response(state.pipeline.generate(prompt).await)
}

/// Script -> model, skipping the LLM
async fn execute(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let request: ExecuteRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };

    info!(code_len = request.python_code.len(), "Execute request");
    pipeline_response(state.pipeline.execute_script(&request.python_code).await)
}

async fn file_not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "File not found")
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, String> {
    if body.is_empty() {
        return Err("Request body is required".to_string());
    }

    serde_json::from_slice(body).map_err(|err| format!("Invalid JSON body: {err}"))
}

fn pipeline_response(result: PipelineResult) -> Response {
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result)).into_response()
}

fn error_response(error: String) -> Response {
    warn!(error = %error, "Rejected request");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            success: false,
            error,
            fallback_available: true,
        }),
    )
        .into_response()
}
