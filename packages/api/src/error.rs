// ABOUTME: HTTP error type and its JSON error body
// ABOUTME: Maps execution, store and sandbox failures to status codes and stable error codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coderun_executions::ExecutionError;
use coderun_sandbox::OrchestratorError;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Main application error type that all handlers should return
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Structured error response format for API consistency
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

/// Error detail structure with machine-readable codes
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<HashMap<String, String>>,
}

fn orchestrator_status_and_code(error: &OrchestratorError) -> (StatusCode, &'static str) {
    match error {
        OrchestratorError::BadRequest(_) => (StatusCode::UNPROCESSABLE_ENTITY, "SANDBOX_REJECTED"),
        OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "SANDBOX_NOT_FOUND"),
        OrchestratorError::Unavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "SANDBOX_UNAVAILABLE")
        }
        OrchestratorError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SANDBOX_ERROR"),
    }
}

fn orchestrator_message(error: &OrchestratorError) -> &'static str {
    match error {
        OrchestratorError::BadRequest(_) => "The sandbox runtime rejected the job",
        OrchestratorError::NotFound(_) => "The sandbox job was not found",
        OrchestratorError::Unavailable(_) => "The sandbox runtime is unavailable",
        OrchestratorError::Internal(_) => "The sandbox runtime reported an error",
    }
}

impl AppError {
    /// Convert AppError to appropriate HTTP status code and error code
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Execution(execution_error) => match execution_error {
                ExecutionError::InvalidEncoding(_) => (StatusCode::BAD_REQUEST, "INVALID_ENCODING"),
                ExecutionError::EmptyCode => (StatusCode::BAD_REQUEST, "EMPTY_CODE"),
                ExecutionError::CodeTooLarge { .. } => (StatusCode::BAD_REQUEST, "CODE_TOO_LARGE"),
                ExecutionError::UnsupportedLanguage { .. } => {
                    (StatusCode::BAD_REQUEST, "UNSUPPORTED_LANGUAGE")
                }
                ExecutionError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ExecutionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
                ExecutionError::Orchestrator(e) => orchestrator_status_and_code(e),
                ExecutionError::SubmissionFailed { source, .. } => {
                    orchestrator_status_and_code(source)
                }
            },
        }
    }

    /// Get user-friendly error message (sanitized for external consumption)
    fn to_user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("Validation failed: {}", msg),
            AppError::Execution(execution_error) => match execution_error {
                ExecutionError::InvalidEncoding(_) => {
                    "Code must be base64-encoded UTF-8 text".to_string()
                }
                ExecutionError::EmptyCode => "Code must not be empty".to_string(),
                ExecutionError::CodeTooLarge { size, limit } => {
                    format!("Code is {} bytes; the limit is {} bytes", size, limit)
                }
                ExecutionError::UnsupportedLanguage { language, .. } => {
                    format!("Language '{}' is not supported", language)
                }
                ExecutionError::NotFound(id) => format!("Execution {} not found", id),
                ExecutionError::Store(_) => "Execution store error".to_string(),
                ExecutionError::Orchestrator(e) => orchestrator_message(e).to_string(),
                ExecutionError::SubmissionFailed { source, .. } => {
                    format!("Failed to launch execution: {}", orchestrator_message(source))
                }
            },
        }
    }

    fn details(&self) -> Option<HashMap<String, String>> {
        match self {
            AppError::Execution(ExecutionError::UnsupportedLanguage { supported, .. }) => {
                Some(HashMap::from([("supported".to_string(), supported.join(", "))]))
            }
            AppError::Execution(ExecutionError::CodeTooLarge { limit, .. }) => {
                Some(HashMap::from([("limit".to_string(), limit.to_string())]))
            }
            AppError::Execution(ExecutionError::SubmissionFailed { execution_id, .. }) => Some(
                HashMap::from([("execution_id".to_string(), execution_id.clone())]),
            ),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.to_status_and_code();

        // Server-side failures are logged with full context; the body stays generic
        if status_code.is_server_error() {
            error!(
                request_id = %request_id,
                error_code = %error_code,
                error = %self,
                "Request failed"
            );
        } else {
            info!(
                request_id = %request_id,
                error_code = %error_code,
                error = %self,
                "API error response"
            );
        }

        let error_response = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: error_code.to_string(),
                message: self.to_user_message(),
                details: self.details(),
            },
            request_id,
        };

        (status_code, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_storage::StoreError;

    fn status_and_code(error: ExecutionError) -> (StatusCode, &'static str) {
        AppError::from(error).to_status_and_code()
    }

    #[test]
    fn test_validation_errors_are_bad_request() {
        assert_eq!(
            status_and_code(ExecutionError::InvalidEncoding("bad".into())),
            (StatusCode::BAD_REQUEST, "INVALID_ENCODING")
        );
        assert_eq!(
            status_and_code(ExecutionError::EmptyCode),
            (StatusCode::BAD_REQUEST, "EMPTY_CODE")
        );
        assert_eq!(
            status_and_code(ExecutionError::CodeTooLarge { size: 10, limit: 5 }),
            (StatusCode::BAD_REQUEST, "CODE_TOO_LARGE")
        );
        assert_eq!(
            status_and_code(ExecutionError::UnsupportedLanguage {
                language: "ruby".into(),
                supported: vec!["python".into()],
            }),
            (StatusCode::BAD_REQUEST, "UNSUPPORTED_LANGUAGE")
        );
        assert_eq!(
            AppError::validation("missing field").to_status_and_code(),
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        );
    }

    #[test]
    fn test_not_found_error() {
        assert_eq!(
            status_and_code(ExecutionError::NotFound("abc".into())),
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        );
    }

    #[test]
    fn test_store_error_is_internal() {
        assert_eq!(
            status_and_code(ExecutionError::Store(StoreError::Conflict("abc".into()))),
            (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
        );
    }

    #[test]
    fn test_orchestrator_errors_have_distinct_statuses() {
        let cases = [
            (
                OrchestratorError::BadRequest("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
                "SANDBOX_REJECTED",
            ),
            (
                OrchestratorError::NotFound("x".into()),
                StatusCode::NOT_FOUND,
                "SANDBOX_NOT_FOUND",
            ),
            (
                OrchestratorError::Unavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "SANDBOX_UNAVAILABLE",
            ),
            (
                OrchestratorError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "SANDBOX_ERROR",
            ),
        ];

        for (error, status, code) in cases {
            assert_eq!(
                status_and_code(ExecutionError::Orchestrator(error.clone())),
                (status, code)
            );
            assert_eq!(
                status_and_code(ExecutionError::SubmissionFailed {
                    execution_id: "abc".into(),
                    source: error,
                }),
                (status, code)
            );
        }
    }

    #[test]
    fn test_submission_failure_details_carry_execution_id() {
        let error = AppError::from(ExecutionError::SubmissionFailed {
            execution_id: "abc".into(),
            source: OrchestratorError::Internal("boom".into()),
        });
        let details = error.details().unwrap();
        assert_eq!(details.get("execution_id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_user_message_sanitization() {
        let error = AppError::from(ExecutionError::Orchestrator(OrchestratorError::Internal(
            "dial unix /var/run/docker.sock: permission denied".into(),
        )));
        let message = error.to_user_message();
        assert_eq!(message, "The sandbox runtime reported an error");
        assert!(!message.contains("docker.sock"));
    }
}
