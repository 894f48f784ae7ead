// ABOUTME: In-memory job orchestrator for tests
// ABOUTME: Jobs are scripted by the test; failures can be queued per operation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coderun_core::ExecutionId;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::orchestrator::{
    JobLogs, JobOrchestrator, JobSpec, JobStatus, OrchestratorError, Result,
};
use crate::reaper::JobPruner;

#[derive(Debug, Clone)]
struct FakeJob {
    spec: JobSpec,
    status: JobStatus,
    logs: JobLogs,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct FakeState {
    jobs: HashMap<ExecutionId, FakeJob>,
    submit_failures: VecDeque<OrchestratorError>,
    status_failures: VecDeque<OrchestratorError>,
    logs_failures: VecDeque<OrchestratorError>,
    delete_failures: VecDeque<OrchestratorError>,
    submit_calls: usize,
    delete_calls: usize,
    unavailable: bool,
}

/// Scriptable [`JobOrchestrator`]. Submitted jobs start `Pending` and only
/// move when the test says so.
#[derive(Debug, Default)]
pub struct FakeOrchestrator {
    state: Mutex<FakeState>,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job(&self, execution_id: &ExecutionId) -> Option<JobSpec> {
        self.state
            .lock()
            .await
            .jobs
            .get(execution_id)
            .map(|job| job.spec.clone())
    }

    pub async fn has_job(&self, execution_id: &ExecutionId) -> bool {
        self.state.lock().await.jobs.contains_key(execution_id)
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn set_status(&self, execution_id: &ExecutionId, status: JobStatus) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(execution_id) {
            if matches!(status, JobStatus::Succeeded | JobStatus::Failed(_)) {
                job.finished_at.get_or_insert_with(Utc::now);
            }
            job.status = status;
        }
    }

    pub async fn set_logs(&self, execution_id: &ExecutionId, logs: JobLogs) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(execution_id) {
            job.logs = logs;
        }
    }

    /// Finish the job successfully with `output` as its logs
    pub async fn succeed(&self, execution_id: &ExecutionId, output: &str) {
        self.set_logs(execution_id, JobLogs::from_output(output.to_string()))
            .await;
        self.set_status(execution_id, JobStatus::Succeeded).await;
    }

    pub async fn fail(&self, execution_id: &ExecutionId, reason: &str) {
        self.set_status(execution_id, JobStatus::Failed(reason.to_string()))
            .await;
    }

    /// Drop the job as if the backend garbage-collected it
    pub async fn remove_job(&self, execution_id: &ExecutionId) {
        self.state.lock().await.jobs.remove(execution_id);
    }

    pub async fn fail_next_submit(&self, error: OrchestratorError) {
        self.state.lock().await.submit_failures.push_back(error);
    }

    pub async fn fail_next_status(&self, error: OrchestratorError) {
        self.state.lock().await.status_failures.push_back(error);
    }

    pub async fn fail_next_logs(&self, error: OrchestratorError) {
        self.state.lock().await.logs_failures.push_back(error);
    }

    pub async fn fail_next_delete(&self, error: OrchestratorError) {
        self.state.lock().await.delete_failures.push_back(error);
    }

    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.unavailable = !available;
    }

    pub async fn submit_calls(&self) -> usize {
        self.state.lock().await.submit_calls
    }

    pub async fn delete_calls(&self) -> usize {
        self.state.lock().await.delete_calls
    }
}

#[async_trait]
impl JobOrchestrator for FakeOrchestrator {
    async fn submit(&self, job: &JobSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.submit_calls += 1;
        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }

        state
            .jobs
            .entry(job.execution_id.clone())
            .or_insert_with(|| FakeJob {
                spec: job.clone(),
                status: JobStatus::Pending,
                logs: JobLogs::NoOutput,
                finished_at: None,
            });
        Ok(())
    }

    async fn get_status(&self, execution_id: &ExecutionId) -> Result<JobStatus> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.status_failures.pop_front() {
            return Err(error);
        }

        state
            .jobs
            .get(execution_id)
            .map(|job| job.status.clone())
            .ok_or_else(|| OrchestratorError::NotFound(execution_id.to_string()))
    }

    async fn get_logs(&self, execution_id: &ExecutionId) -> Result<JobLogs> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.logs_failures.pop_front() {
            return Err(error);
        }

        Ok(state
            .jobs
            .get(execution_id)
            .map(|job| job.logs.clone())
            .unwrap_or(JobLogs::NoOutput))
    }

    async fn delete(&self, execution_id: &ExecutionId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.delete_calls += 1;
        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }

        state.jobs.remove(execution_id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.state.lock().await.unavailable {
            Err(OrchestratorError::Unavailable(
                "fake orchestrator offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobPruner for FakeOrchestrator {
    async fn prune_finished_jobs(&self, max_age: chrono::Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.lock().await;

        let expired: Vec<ExecutionId> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.finished_at.is_some_and(|at| at <= cutoff))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.jobs.remove(id);
        }
        Ok(expired.into_iter().map(|id| id.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageRegistry;
    use crate::orchestrator::SecurityProfile;
    use crate::reaper::JobReaper;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(id: &ExecutionId) -> JobSpec {
        JobSpec {
            execution_id: id.clone(),
            runtime: LanguageRegistry::new().unwrap().get("bash").unwrap().clone(),
            source_code: "echo hi".to_string(),
            security_profile: SecurityProfile::default(),
        }
    }

    #[tokio::test]
    async fn test_scripted_lifecycle() {
        let fake = FakeOrchestrator::new();
        let id = ExecutionId::generate();

        fake.submit(&job(&id)).await.unwrap();
        assert_eq!(fake.get_status(&id).await.unwrap(), JobStatus::Pending);

        fake.succeed(&id, "hi\n").await;
        assert_eq!(fake.get_status(&id).await.unwrap(), JobStatus::Succeeded);
        assert_eq!(
            fake.get_logs(&id).await.unwrap(),
            JobLogs::Output("hi\n".to_string())
        );

        fake.delete(&id).await.unwrap();
        fake.delete(&id).await.unwrap();
        assert!(matches!(
            fake.get_status(&id).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resubmit_keeps_existing_job() {
        let fake = FakeOrchestrator::new();
        let id = ExecutionId::generate();

        fake.submit(&job(&id)).await.unwrap();
        fake.set_status(&id, JobStatus::Running).await;
        fake.submit(&job(&id)).await.unwrap();

        assert_eq!(fake.get_status(&id).await.unwrap(), JobStatus::Running);
        assert_eq!(fake.job_count().await, 1);
        assert_eq!(fake.submit_calls().await, 2);
    }

    #[tokio::test]
    async fn test_queued_failures_are_consumed_once() {
        let fake = FakeOrchestrator::new();
        let id = ExecutionId::generate();

        fake.fail_next_submit(OrchestratorError::Unavailable("flaky".into()))
            .await;
        assert!(fake.submit(&job(&id)).await.is_err());
        assert!(fake.submit(&job(&id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_reaper_prunes_only_finished_jobs() {
        let fake = Arc::new(FakeOrchestrator::new());
        let done = ExecutionId::generate();
        let running = ExecutionId::generate();

        fake.submit(&job(&done)).await.unwrap();
        fake.submit(&job(&running)).await.unwrap();
        fake.fail(&done, "exit code 1").await;
        fake.set_status(&running, JobStatus::Running).await;

        let reaper = JobReaper::new(fake.clone(), Duration::from_secs(60), chrono::Duration::zero());
        assert_eq!(reaper.sweep().await, 1);
        assert!(!fake.has_job(&done).await);
        assert!(fake.has_job(&running).await);
    }
}
