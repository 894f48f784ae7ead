// ABOUTME: Execution record types and the monotonic status state machine
// ABOUTME: Shared by the store, the sandbox orchestrator and the HTTP layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque, globally unique identifier of one submitted execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Generate a fresh random (v4) identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown execution status: {0}")]
pub struct UnknownStatus(pub String);

/// Lifecycle status of an execution.
///
/// Statuses only move forward: `Pending -> Running -> {Succeeded, Failed}`,
/// `Pending` may jump straight to a terminal status, and every status except
/// `CleanedUp` may move to `CleanedUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "success")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cleaned_up")]
    CleanedUp,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Succeeded,
        ExecutionStatus::Failed,
        ExecutionStatus::CleanedUp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::CleanedUp => "cleaned_up",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cleaned_up" => Ok(ExecutionStatus::CleanedUp),
            other => Err(UnknownStatus(other.to_string())),
        }
    }

    /// Position in the lifecycle. `Succeeded` and `Failed` share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed => 2,
            ExecutionStatus::CleanedUp => 3,
        }
    }

    /// Terminal statuses are never advanced by polling.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::CleanedUp
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            (Pending, Running | Succeeded | Failed) => true,
            (Running, Succeeded | Failed) => true,
            _ => false,
        }
    }

    /// Whether a transition written with `expected` as the caller's view may
    /// be applied to a record currently in `self`.
    ///
    /// The move must be legal from the current status. A record that moved
    /// past the caller's view still accepts a move further forward, so a
    /// completion observed from Pending lands on a record another poller
    /// already marked Running.
    pub fn accepts(&self, expected: ExecutionStatus, next: ExecutionStatus) -> bool {
        self.can_transition_to(next)
            && (self.rank() <= expected.rank() || self.rank() < next.rank())
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested status change together with the fields it carries.
///
/// Constructors keep `output` populated only for `Succeeded` and
/// `failure_reason` only for `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    to: ExecutionStatus,
    output: Option<String>,
    failure_reason: Option<String>,
}

impl Transition {
    pub fn running() -> Self {
        Self {
            to: ExecutionStatus::Running,
            output: None,
            failure_reason: None,
        }
    }

    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            to: ExecutionStatus::Succeeded,
            output: Some(output.into()),
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            to: ExecutionStatus::Failed,
            output: None,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn cleaned_up() -> Self {
        Self {
            to: ExecutionStatus::CleanedUp,
            output: None,
            failure_reason: None,
        }
    }

    pub fn to(&self) -> ExecutionStatus {
        self.to
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }
}

/// Durable record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub language: String,
    pub source_code: String,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Fresh record for a newly accepted submission
    pub fn pending(
        execution_id: ExecutionId,
        language: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            language: language.into(),
            source_code: source_code.into(),
            status: ExecutionStatus::Pending,
            output: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One entry of an execution's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub execution_id: ExecutionId,
    pub from_status: Option<ExecutionStatus>,
    pub to_status: ExecutionStatus,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
