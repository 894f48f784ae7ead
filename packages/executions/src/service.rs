// ABOUTME: Execution lifecycle service: submit, poll, cleanup and history
// ABOUTME: Every status change is a compare-and-update on the status the caller observed

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use coderun_core::{
    retry_with_backoff, ExecutionId, ExecutionRecord, ExecutionStatus, RetryConfig,
    StatusTransition, Transition,
};
use coderun_sandbox::{
    JobLogs, JobOrchestrator, JobSpec, JobStatus, LanguageRegistry, OrchestratorError,
    SecurityProfile,
};
use coderun_storage::{ExecutionStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, Result};

/// Output recorded when a job succeeded without printing anything
pub const NO_OUTPUT_SENTINEL: &str = "No output captured.";

/// Failure reason for a job the sandbox lost before it finished
pub const VANISHED_JOB_REASON: &str = "sandbox job disappeared before completion";

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub security_profile: SecurityProfile,
    /// Largest accepted decoded source, in bytes
    pub max_source_bytes: usize,
    pub retry: RetryConfig,
    /// How long a Pending record may have no sandbox job before it is failed
    pub pending_grace: chrono::Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            security_profile: SecurityProfile::default(),
            max_source_bytes: 64 * 1024,
            retry: RetryConfig::default(),
            pending_grace: chrono::Duration::seconds(60),
        }
    }
}

/// Whether the service's dependencies answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub store: bool,
    pub sandbox: bool,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.store && self.sandbox
    }
}

pub struct ExecutionService {
    store: Arc<dyn ExecutionStore>,
    orchestrator: Arc<dyn JobOrchestrator>,
    languages: Arc<LanguageRegistry>,
    settings: ExecutionSettings,
}

impl ExecutionService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        orchestrator: Arc<dyn JobOrchestrator>,
        languages: Arc<LanguageRegistry>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            languages,
            settings,
        }
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Validate a submission, persist it as Pending and launch its sandbox job.
    ///
    /// The record is durable before the job exists. If the launch fails the
    /// record is moved to Failed and `SubmissionFailed` carries its id.
    pub async fn submit(&self, encoded_code: &str, language: &str) -> Result<ExecutionId> {
        let runtime = self
            .languages
            .get(language)
            .ok_or_else(|| ExecutionError::UnsupportedLanguage {
                language: language.to_string(),
                supported: self.languages.supported_ids(),
            })?
            .clone();
        let source_code = self.decode_source(encoded_code)?;

        let record =
            ExecutionRecord::pending(ExecutionId::generate(), runtime.id.clone(), source_code);
        let execution_id = record.execution_id.clone();

        retry_with_backoff(&self.settings.retry, "store.create", || {
            self.store.create(&record)
        })
        .await?;
        debug!(execution_id = %execution_id, "Execution record created");

        let job = JobSpec {
            execution_id: execution_id.clone(),
            runtime,
            source_code: record.source_code,
            security_profile: self.settings.security_profile.clone(),
        };

        match retry_with_backoff(&self.settings.retry, "sandbox.submit", || {
            self.orchestrator.submit(&job)
        })
        .await
        {
            Ok(()) => {
                info!(
                    execution_id = %execution_id,
                    language = %job.runtime.id,
                    "Execution submitted"
                );
                Ok(execution_id)
            }
            Err(e) => {
                self.mark_submit_failed(&execution_id, &e).await;
                Err(ExecutionError::SubmissionFailed {
                    execution_id: execution_id.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Current snapshot of an execution, advancing it from the sandbox when
    /// it is not yet terminal. Terminal records never touch the sandbox.
    pub async fn get_result(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        let record = self.load(execution_id).await?;
        if record.is_terminal() {
            return Ok(record);
        }

        let observed = retry_with_backoff(&self.settings.retry, "sandbox.get_status", || {
            self.orchestrator.get_status(execution_id)
        })
        .await;

        let transition = match observed {
            Ok(JobStatus::Pending) => return Ok(record),
            Ok(JobStatus::Running) => {
                if record.status == ExecutionStatus::Running {
                    return Ok(record);
                }
                Transition::running()
            }
            Ok(JobStatus::Succeeded) => {
                let logs = retry_with_backoff(&self.settings.retry, "sandbox.get_logs", || {
                    self.orchestrator.get_logs(execution_id)
                })
                .await?;
                match logs {
                    JobLogs::Output(output) => Transition::succeeded(output),
                    JobLogs::NoOutput => Transition::succeeded(NO_OUTPUT_SENTINEL),
                }
            }
            Ok(JobStatus::Failed(reason)) => Transition::failed(reason),
            Err(OrchestratorError::NotFound(_)) => {
                if !self.job_vanished(&record) {
                    // Submission may still be in flight
                    return Ok(record);
                }
                warn!(
                    execution_id = %execution_id,
                    status = %record.status,
                    "Sandbox job missing for unfinished execution"
                );
                Transition::failed(VANISHED_JOB_REASON)
            }
            Err(e) => return Err(e.into()),
        };

        self.advance(&record, transition).await
    }

    /// Delete the sandbox job and mark the execution CleanedUp. Safe to repeat.
    pub async fn cleanup(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        let record = self.load(execution_id).await?;

        retry_with_backoff(&self.settings.retry, "sandbox.delete", || {
            self.orchestrator.delete(execution_id)
        })
        .await?;

        if record.status == ExecutionStatus::CleanedUp {
            return Ok(record);
        }
        if !record.is_terminal() {
            info!(execution_id = %execution_id, status = %record.status, "Cancelling unfinished execution");
        }

        match retry_with_backoff(&self.settings.retry, "store.compare_and_update", || {
            self.store.compare_and_update(
                execution_id,
                ExecutionStatus::CleanedUp,
                Transition::cleaned_up(),
            )
        })
        .await
        {
            Ok(updated) => {
                info!(execution_id = %execution_id, "Execution cleaned up");
                Ok(updated)
            }
            Err(StoreError::StaleUpdate { .. }) => self.load(execution_id).await,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn history(&self, execution_id: &ExecutionId) -> Result<Vec<StatusTransition>> {
        Ok(retry_with_backoff(&self.settings.retry, "store.history", || {
            self.store.history(execution_id)
        })
        .await?)
    }

    pub async fn readiness(&self) -> Readiness {
        let (store, sandbox) = tokio::join!(self.store.ping(), self.orchestrator.ping());

        if let Err(e) = &store {
            warn!("Execution store not ready: {}", e);
        }
        if let Err(e) = &sandbox {
            warn!("Sandbox runtime not ready: {}", e);
        }

        Readiness {
            store: store.is_ok(),
            sandbox: sandbox.is_ok(),
        }
    }

    fn decode_source(&self, encoded_code: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(encoded_code.trim())
            .map_err(|e| ExecutionError::InvalidEncoding(e.to_string()))?;

        if bytes.is_empty() {
            return Err(ExecutionError::EmptyCode);
        }
        if bytes.len() > self.settings.max_source_bytes {
            return Err(ExecutionError::CodeTooLarge {
                size: bytes.len(),
                limit: self.settings.max_source_bytes,
            });
        }

        String::from_utf8(bytes)
            .map_err(|_| ExecutionError::InvalidEncoding("decoded code is not UTF-8".to_string()))
    }

    async fn load(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        Ok(retry_with_backoff(&self.settings.retry, "store.get", || {
            self.store.get(execution_id)
        })
        .await?)
    }

    fn job_vanished(&self, record: &ExecutionRecord) -> bool {
        match record.status {
            ExecutionStatus::Running => true,
            ExecutionStatus::Pending => {
                Utc::now() - record.created_at > self.settings.pending_grace
            }
            _ => false,
        }
    }

    /// Apply one observed transition; losing a race returns the newer snapshot
    async fn advance(
        &self,
        record: &ExecutionRecord,
        transition: Transition,
    ) -> Result<ExecutionRecord> {
        let execution_id = &record.execution_id;
        let to = transition.to();

        match retry_with_backoff(&self.settings.retry, "store.compare_and_update", || {
            self.store
                .compare_and_update(execution_id, record.status, transition.clone())
        })
        .await
        {
            Ok(updated) => {
                info!(
                    execution_id = %execution_id,
                    from = %record.status,
                    to = %to,
                    "Execution status updated"
                );
                Ok(updated)
            }
            Err(StoreError::StaleUpdate { current, .. }) => {
                debug!(
                    execution_id = %execution_id,
                    current = %current,
                    observed = %to,
                    "Execution already advanced by another request"
                );
                self.load(execution_id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_submit_failed(&self, execution_id: &ExecutionId, cause: &OrchestratorError) {
        warn!(
            execution_id = %execution_id,
            error = %cause,
            "Sandbox submission failed, marking execution failed"
        );

        let transition = Transition::failed(format!("submission failed: {}", cause));
        let result = retry_with_backoff(&self.settings.retry, "store.compare_and_update", || {
            self.store
                .compare_and_update(execution_id, ExecutionStatus::Pending, transition.clone())
        })
        .await;

        if let Err(e) = result {
            error!(
                execution_id = %execution_id,
                error = %e,
                "Failed to record submission failure"
            );
        }

        // A create that landed before the failure leaves a job the record no longer tracks
        let removed = retry_with_backoff(&self.settings.retry, "sandbox.delete", || {
            self.orchestrator.delete(execution_id)
        })
        .await;

        if let Err(e) = removed {
            warn!(
                execution_id = %execution_id,
                error = %e,
                "Failed to remove partially launched job"
            );
        }
    }
}
