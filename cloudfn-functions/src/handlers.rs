//! Function HTTP API handlers
//!
//! JSON management endpoints plus invocation, health and metrics.
//! Management errors are rendered as `{"code", "message"}` bodies.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use cloudfn_core::{ApiError, ErrorCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::function::Function;
use crate::invocation::ExecuteRequest;
use crate::service::{
    CreateFunctionInput, FunctionService, FunctionServiceError, UpdateFunctionInput,
};

/// Shared state for function handlers
pub struct FunctionsState {
    pub service: FunctionService,
}

impl FunctionsState {
    pub fn new(service: FunctionService) -> Self {
        Self { service }
    }
}

/// Routes for the function API
pub fn router(state: Arc<FunctionsState>) -> Router {
    Router::new()
        .route("/functions", post(create_function).get(list_functions))
        .route(
            "/functions/:id",
            get(get_function).put(update_function).delete(delete_function),
        )
        .route("/functions/:id/invoke", post(invoke_function))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ListFunctionsResponse {
    pub functions: Vec<Function>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct DeleteFunctionResponse {
    pub message: String,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

fn error_response(error: impl Into<ApiError>) -> Response {
    let error = error.into();
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        error.to_json(),
    )
        .into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(ApiError::new(
            ErrorCode::ValidationError,
            format!("Invalid request body: {e}"),
        ))
    })
}

/// Run a registry mutation off the async workers.
///
/// Mutations write source files and the snapshot while holding the registry
/// write lock.
async fn run_blocking<T, F>(state: Arc<FunctionsState>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&FunctionService) -> Result<T, FunctionServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state.service))
        .await
        .map_err(|e| {
            ApiError::new(
                ErrorCode::ServiceException,
                format!("Request task failed: {e}"),
            )
        })?
        .map_err(ApiError::from)
}

// === Handler functions ===

/// POST /functions
pub async fn create_function(State(state): State<Arc<FunctionsState>>, body: Bytes) -> Response {
    let input: CreateFunctionInput = match parse_body(&body) {
        Ok(input) => input,
        Err(response) => return response,
    };
    info!(name = %input.name, runtime = %input.runtime, "CreateFunction");

    match run_blocking(state, move |service| service.create_function(input)).await {
        Ok(function) => (StatusCode::CREATED, Json(function)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /functions
pub async fn list_functions(State(state): State<Arc<FunctionsState>>) -> Response {
    debug!("ListFunctions");

    let functions = state.service.list_functions();
    let count = functions.len();
    Json(ListFunctionsResponse { functions, count }).into_response()
}

/// GET /functions/:id
pub async fn get_function(
    State(state): State<Arc<FunctionsState>>,
    Path(id): Path<String>,
) -> Response {
    debug!(function_id = %id, "GetFunction");

    match state.service.get_function(&id) {
        Ok(function) => Json(function).into_response(),
        Err(e) => error_response(e),
    }
}

/// PUT /functions/:id
pub async fn update_function(
    State(state): State<Arc<FunctionsState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    info!(function_id = %id, "UpdateFunction");

    let input: UpdateFunctionInput = match parse_body(&body) {
        Ok(input) => input,
        Err(response) => return response,
    };

    let target = id.clone();
    match run_blocking(state, move |service| service.update_function(&target, input)).await {
        Ok(function) => Json(function).into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /functions/:id
pub async fn delete_function(
    State(state): State<Arc<FunctionsState>>,
    Path(id): Path<String>,
) -> Response {
    info!(function_id = %id, "DeleteFunction");

    let target = id.clone();
    match run_blocking(state, move |service| service.delete_function(&target)).await {
        Ok(()) => Json(DeleteFunctionResponse {
            message: "Function deleted".to_string(),
            id,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /functions/:id/invoke
///
/// 200 with the response when the invocation succeeded, 500 with the same
/// shape when it failed. An empty body invokes with a null event.
pub async fn invoke_function(
    State(state): State<Arc<FunctionsState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    debug!(function_id = %id, "Invoke");

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ExecuteRequest::default()
    } else {
        match parse_body::<ExecuteRequest>(&body) {
            Ok(request) => request,
            Err(response) => return response,
        }
    };

    match state.service.invoke(&id, request).await {
        Ok(response) if response.success => (StatusCode::OK, Json(response)).into_response(),
        Ok(response) => (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /health
pub async fn health_check() -> Response {
    Json(HealthResponse {
        status: "ok",
        service: "cloudfn",
        version: env!("CARGO_PKG_VERSION"),
    })
    .into_response()
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<FunctionsState>>) -> Response {
    Json(state.service.metrics().snapshot()).into_response()
}
