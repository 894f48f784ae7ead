// ABOUTME: Error type for execution lifecycle operations
// ABOUTME: Validation failures, missing executions, and wrapped store or sandbox failures

use coderun_sandbox::OrchestratorError;
use coderun_storage::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Invalid base64 encoding: {0}")]
    InvalidEncoding(String),

    #[error("Decoded code is empty")]
    EmptyCode,

    #[error("Code is {size} bytes, limit is {limit}")]
    CodeTooLarge { size: usize, limit: usize },

    #[error("Unsupported language: {language}")]
    UnsupportedLanguage {
        language: String,
        supported: Vec<String>,
    },

    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    #[error("Sandbox error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// The record exists (marked Failed) but the sandbox job was never launched
    #[error("Failed to launch execution {execution_id}: {source}")]
    SubmissionFailed {
        execution_id: String,
        #[source]
        source: OrchestratorError,
    },
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

impl From<StoreError> for ExecutionError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => ExecutionError::NotFound(id),
            other => ExecutionError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_becomes_not_found() {
        let error: ExecutionError = StoreError::NotFound("abc".to_string()).into();
        assert!(matches!(error, ExecutionError::NotFound(id) if id == "abc"));

        let error: ExecutionError = StoreError::Conflict("abc".to_string()).into();
        assert!(matches!(error, ExecutionError::Store(_)));
    }

    #[test]
    fn test_submission_failed_message() {
        let error = ExecutionError::SubmissionFailed {
            execution_id: "abc".to_string(),
            source: OrchestratorError::Unavailable("docker down".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Failed to launch execution abc: Sandbox runtime unavailable: docker down"
        );
    }
}
