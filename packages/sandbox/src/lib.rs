// ABOUTME: Sandboxed job orchestration for Coderun
// ABOUTME: Language registry, the JobOrchestrator trait, its Docker backend and the job reaper

pub mod docker;
pub mod languages;
pub mod orchestrator;
pub mod reaper;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use docker::DockerJobOrchestrator;
pub use languages::{LanguageError, LanguageRegistry, LanguageRuntime};
pub use orchestrator::{
    job_name, JobLogs, JobOrchestrator, JobSpec, JobStatus, OrchestratorError, SecurityProfile,
    JOB_NAME_PREFIX,
};
pub use reaper::{JobPruner, JobReaper};

#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeOrchestrator;
