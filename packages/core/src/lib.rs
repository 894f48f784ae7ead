// ABOUTME: Core types and utilities for Coderun
// ABOUTME: Execution records, the status state machine, and the retry policy shared by every crate

pub mod retry;
pub mod types;

// Re-export main types
pub use types::{
    ExecutionId, ExecutionRecord, ExecutionStatus, StatusTransition, Transition, UnknownStatus,
};

// Re-export retry policy
pub use retry::{retry_with_backoff, RetryConfig, Transient};
