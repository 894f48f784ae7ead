// ABOUTME: HTTP request handlers for code execution
// ABOUTME: Submit, poll, history and cleanup endpoints over the execution service

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use coderun_core::{ExecutionId, ExecutionRecord, ExecutionStatus, StatusTransition};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiResult, AppError};
use crate::ApiState;

/// Request to run a program
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Base64-encoded source code
    pub code: String,
    pub language: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub message: String,
}

/// Snapshot of an execution as returned to clients
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub language: String,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ExecutionRecord> for ExecutionResponse {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id.to_string(),
            language: record.language,
            status: record.status,
            output: record.output,
            failure_reason: record.failure_reason,
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub execution_id: String,
    pub transitions: Vec<StatusTransition>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub message: String,
}

/// Submit code for execution
///
/// POST /execute
pub async fn execute(
    State(state): State<ApiState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<Json<ExecuteResponse>> {
    let Json(request) = payload.map_err(|rejection| AppError::validation(rejection.body_text()))?;

    let execution_id = state
        .service
        .submit(&request.code, &request.language)
        .await?;
    info!("Accepted execution {} ({})", execution_id, request.language);

    Ok(Json(ExecuteResponse {
        execution_id: execution_id.to_string(),
        message: "Execution submitted".to_string(),
    }))
}

/// Current status and output of an execution
///
/// GET /result/{execution_id}
pub async fn get_result(
    State(state): State<ApiState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionResponse>> {
    let record = state
        .service
        .get_result(&ExecutionId::from(execution_id))
        .await?;
    Ok(Json(record.into()))
}

/// Ordered status history of an execution
///
/// GET /result/{execution_id}/history
pub async fn get_history(
    State(state): State<ApiState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<HistoryResponse>> {
    let execution_id = ExecutionId::from(execution_id);
    let transitions = state.service.history(&execution_id).await?;

    Ok(Json(HistoryResponse {
        execution_id: execution_id.to_string(),
        transitions,
    }))
}

/// Remove the sandbox job and mark the execution cleaned up
///
/// DELETE /cleanup/{execution_id}
pub async fn cleanup(
    State(state): State<ApiState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<CleanupResponse>> {
    let record = state
        .service
        .cleanup(&ExecutionId::from(execution_id))
        .await?;
    info!("Cleaned up execution {}", record.execution_id);

    Ok(Json(CleanupResponse {
        execution_id: record.execution_id.to_string(),
        status: record.status,
        message: "Execution resources cleaned up".to_string(),
    }))
}
