// ABOUTME: JobOrchestrator trait and the types exchanged with sandbox backends
// ABOUTME: Job specs, the fixed security profile, observed job status and captured logs

use async_trait::async_trait;
use coderun_core::{ExecutionId, Transient};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::languages::LanguageRuntime;

/// Prefix of every sandbox job name; the rest is the execution id
pub const JOB_NAME_PREFIX: &str = "coderun-job-";

/// Deterministic job name for an execution
pub fn job_name(execution_id: &ExecutionId) -> String {
    format!("{}{}", JOB_NAME_PREFIX, execution_id)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The backend refused the job definition
    #[error("Job rejected by sandbox runtime: {0}")]
    BadRequest(String),

    #[error("Sandbox job not found: {0}")]
    NotFound(String),

    /// Connection failures and timeouts; worth retrying
    #[error("Sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox runtime error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl Transient for OrchestratorError {
    fn is_transient(&self) -> bool {
        matches!(self, OrchestratorError::Unavailable(_))
    }
}

/// Isolation and resource constraints applied to every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityProfile {
    /// `uid:gid` the program runs as; never root
    pub run_as: String,
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub memory_request_mb: u64,
    pub memory_limit_mb: u64,
    pub pids_limit: i64,
    /// Wall-clock limit enforced inside the sandbox
    pub deadline_secs: u64,
    pub network_disabled: bool,
    pub read_only_rootfs: bool,
    pub tmpfs_size_mb: u64,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            run_as: "65534:65534".to_string(),
            cpu_request: 0.25,
            cpu_limit: 0.5,
            memory_request_mb: 64,
            memory_limit_mb: 128,
            pids_limit: 64,
            deadline_secs: 10,
            network_disabled: true,
            read_only_rootfs: true,
            tmpfs_size_mb: 16,
        }
    }
}

/// Everything a backend needs to launch one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub execution_id: ExecutionId,
    pub runtime: LanguageRuntime,
    pub source_code: String,
    pub security_profile: SecurityProfile,
}

impl JobSpec {
    pub fn job_name(&self) -> String {
        job_name(&self.execution_id)
    }
}

/// Observed state of a sandbox job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

/// Captured combined output of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLogs {
    Output(String),
    NoOutput,
}

impl JobLogs {
    pub fn from_output(output: String) -> Self {
        if output.is_empty() {
            JobLogs::NoOutput
        } else {
            JobLogs::Output(output)
        }
    }
}

/// Backend that runs sandbox jobs.
///
/// Every operation is keyed by execution id; implementations derive the
/// backend job name with [`job_name`] so repeated calls address the same job.
#[async_trait]
pub trait JobOrchestrator: Send + Sync {
    /// Create and start the job. Submitting an existing job is not an error.
    async fn submit(&self, job: &JobSpec) -> Result<()>;

    /// Non-blocking status query. A job that does not exist is `NotFound`.
    async fn get_status(&self, execution_id: &ExecutionId) -> Result<JobStatus>;

    /// Combined stdout/stderr of the job
    async fn get_logs(&self, execution_id: &ExecutionId) -> Result<JobLogs>;

    /// Remove the job and everything it created. Deleting a missing job succeeds.
    async fn delete(&self, execution_id: &ExecutionId) -> Result<()>;

    /// Check the backend is reachable
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_is_deterministic() {
        let id = ExecutionId::from("3f2b9c1e-0000-4000-8000-000000000001");
        assert_eq!(job_name(&id), "coderun-job-3f2b9c1e-0000-4000-8000-000000000001");
        assert_eq!(job_name(&id), job_name(&id.clone()));
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(OrchestratorError::Unavailable("timeout".into()).is_transient());
        assert!(!OrchestratorError::BadRequest("bad".into()).is_transient());
        assert!(!OrchestratorError::NotFound("gone".into()).is_transient());
        assert!(!OrchestratorError::Internal("boom".into()).is_transient());
    }

    #[test]
    fn test_empty_output_is_no_output() {
        assert_eq!(JobLogs::from_output(String::new()), JobLogs::NoOutput);
        assert_eq!(
            JobLogs::from_output("2\n".to_string()),
            JobLogs::Output("2\n".to_string())
        );
    }

    #[test]
    fn test_default_profile_is_locked_down() {
        let profile = SecurityProfile::default();
        assert_ne!(profile.run_as.split(':').next(), Some("0"));
        assert!(profile.network_disabled);
        assert!(profile.read_only_rootfs);
        assert!(profile.cpu_request <= profile.cpu_limit);
        assert!(profile.memory_request_mb <= profile.memory_limit_mb);
    }
}
