// ABOUTME: Execution lifecycle service for Coderun
// ABOUTME: Validates submissions, launches sandbox jobs and reconciles their status into the store

pub mod error;
pub mod service;

pub use error::{ExecutionError, Result};
pub use service::{
    ExecutionService, ExecutionSettings, Readiness, NO_OUTPUT_SENTINEL, VANISHED_JOB_REASON,
};
