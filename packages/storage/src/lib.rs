// ABOUTME: Durable execution store for Coderun
// ABOUTME: ExecutionStore trait with compare-and-update semantics and its SQLite implementation

use async_trait::async_trait;
use coderun_core::{
    ExecutionId, ExecutionRecord, ExecutionStatus, StatusTransition, Transient, Transition,
};
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteExecutionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Execution not found: {0}")]
    NotFound(String),
    #[error("Execution already exists: {0}")]
    Conflict(String),
    #[error("Stale update for {execution_id}: record is {current}, caller expected {expected}")]
    StaleUpdate {
        execution_id: String,
        expected: ExecutionStatus,
        current: ExecutionStatus,
    },
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => is_transient_sqlx(e),
            _ => false,
        }
    }
}

fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_lowercase();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

/// Persistence for execution records.
///
/// Status changes go through `compare_and_update`, which applies a transition
/// only if the record has not advanced past the status the caller observed
/// and the move is legal from the current status. Every applied change is
/// appended to the execution's history.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id already exists.
    async fn create(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord>;

    /// Apply `transition` if allowed from the caller's view `expected`,
    /// returning the updated record or `StaleUpdate` with the current status.
    async fn compare_and_update(
        &self,
        execution_id: &ExecutionId,
        expected: ExecutionStatus,
        transition: Transition,
    ) -> Result<ExecutionRecord>;

    /// Status history in the order it happened, oldest first
    async fn history(&self, execution_id: &ExecutionId) -> Result<Vec<StatusTransition>>;

    async fn ping(&self) -> Result<()>;
}
