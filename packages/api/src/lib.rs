// ABOUTME: HTTP API layer and routing for Coderun
// ABOUTME: Builds the axum router over a shared execution service

use axum::{
    routing::{delete, get, post},
    Router,
};
use coderun_executions::ExecutionService;
use std::sync::Arc;

pub mod error;
pub mod handlers;
pub mod health;

pub use error::{ApiResult, AppError};

/// Shared state for all execution routes
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<ExecutionService>,
}

impl ApiState {
    pub fn new(service: Arc<ExecutionService>) -> Self {
        Self { service }
    }
}

/// Create the API router. Middleware (tracing, CORS) is layered on by the caller.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/result/{execution_id}", get(handlers::get_result))
        .route("/result/{execution_id}/history", get(handlers::get_history))
        .route("/cleanup/{execution_id}", delete(handlers::cleanup))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .with_state(state)
}
