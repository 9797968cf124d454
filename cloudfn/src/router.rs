//! HTTP router for cloudfn

use axum::Router;
use cloudfn_functions::{router as functions_router, FunctionsState};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(state: Arc<FunctionsState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    functions_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
