// ABOUTME: Docker implementation of the job orchestrator using bollard
// ABOUTME: Runs each execution in a locked-down, run-once container named after the execution id

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
        LogsOptions, RemoveContainerOptions, StartContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::{ContainerState, ContainerStateStatusEnum, HostConfig, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use chrono::{DateTime, Utc};
use coderun_core::ExecutionId;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::orchestrator::{
    job_name, JobLogs, JobOrchestrator, JobSpec, JobStatus, OrchestratorError, Result,
};
use crate::reaper::JobPruner;

pub const MANAGED_LABEL: &str = "coderun.managed";
pub const JOB_LABEL: &str = "coderun.job";
pub const EXECUTION_LABEL: &str = "coderun.execution";
pub const LANGUAGE_LABEL: &str = "coderun.language";

const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(300);

pub struct DockerJobOrchestrator {
    client: Docker,
    /// Images known to be present locally, with the time they were confirmed
    image_cache: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    pull_timeout: Duration,
}

impl DockerJobOrchestrator {
    /// Connect to the local Docker daemon with the default pull timeout
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(DEFAULT_PULL_TIMEOUT)
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults().map_err(|e| {
            OrchestratorError::Unavailable(format!("Failed to connect to Docker: {}", e))
        })?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout,
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_docker_error(e, image)),
        }
    }

    /// Make sure `image` is available locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }

        if !self.image_exists(image).await? {
            self.pull_image(image).await?;
        }

        self.image_cache
            .write()
            .await
            .insert(image.to_string(), Utc::now());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            return Err(OrchestratorError::Internal(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(BollardError::DockerResponseServerError {
                        status_code: 404,
                        message,
                    }) => {
                        return Err(OrchestratorError::BadRequest(format!(
                            "Image {} does not exist: {}",
                            image, message
                        )));
                    }
                    Err(e) => return Err(map_docker_error(e, image)),
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OrchestratorError::Unavailable(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self
            .client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!("Started sandbox job {}", name);
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Sandbox job {} already started", name);
                Ok(())
            }
            Err(e) => Err(map_docker_error(e, name)),
        }
    }

    /// A job container that already exists is started only if it never ran
    async fn start_if_created(&self, name: &str) -> Result<()> {
        let info = self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(e, name))?;

        let status = info.state.and_then(|state| state.status);
        if status == Some(ContainerStateStatusEnum::CREATED) {
            self.start(name).await
        } else {
            debug!("Sandbox job {} already launched ({:?})", name, status);
            Ok(())
        }
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(()) => {
                info!("Removed sandbox container {}", container);
                Ok(())
            }
            // Already gone, or another removal is in progress
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!("Sandbox container {} already removed", container);
                Ok(())
            }
            Err(e) => Err(map_docker_error(e, container)),
        }
    }

    async fn list_labelled(&self, label: String) -> Result<Vec<bollard::models::ContainerSummary>> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label])]),
            ..Default::default()
        };

        self.client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_docker_error(e, "list"))
    }
}

#[async_trait]
impl JobOrchestrator for DockerJobOrchestrator {
    async fn submit(&self, job: &JobSpec) -> Result<()> {
        let name = job.job_name();
        self.ensure_image(&job.runtime.image).await?;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        match self
            .client
            .create_container(Some(options), build_container_config(job))
            .await
        {
            Ok(response) => {
                for warning in response.warnings {
                    warn!("Docker warning for {}: {}", name, warning);
                }
                debug!("Created sandbox job {} ({})", name, response.id);
                self.start(&name).await
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!("Sandbox job {} already exists", name);
                self.start_if_created(&name).await
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            }) => {
                // Image vanished since it was cached; the next attempt pulls it again
                self.image_cache.write().await.remove(&job.runtime.image);
                Err(OrchestratorError::Unavailable(format!(
                    "Image {} missing for {}: {}",
                    job.runtime.image, name, message
                )))
            }
            Err(e) => Err(map_docker_error(e, &name)),
        }
    }

    async fn get_status(&self, execution_id: &ExecutionId) -> Result<JobStatus> {
        let name = job_name(execution_id);
        let info = self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(e, &name))?;

        Ok(info
            .state
            .as_ref()
            .map(decode_state)
            .unwrap_or(JobStatus::Pending))
    }

    async fn get_logs(&self, execution_id: &ExecutionId) -> Result<JobLogs> {
        let name = job_name(execution_id);
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = self.client.logs(&name, Some(options));
        let mut bytes = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => bytes.extend_from_slice(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Ok(JobLogs::NoOutput),
                Err(e) => return Err(map_docker_error(e, &name)),
            }
        }

        Ok(JobLogs::from_output(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    }

    async fn delete(&self, execution_id: &ExecutionId) -> Result<()> {
        let name = job_name(execution_id);
        self.remove(&name).await?;

        // Anything else the job left behind carries its label
        let leftovers = self.list_labelled(format!("{}={}", JOB_LABEL, name)).await?;
        for container in leftovers {
            if let Some(id) = container.id {
                self.remove(&id).await?;
            }
        }

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_docker_error(e, "ping"))
    }
}

#[async_trait]
impl JobPruner for DockerJobOrchestrator {
    async fn prune_finished_jobs(&self, max_age: chrono::Duration) -> Result<Vec<String>> {
        let cutoff = (Utc::now() - max_age).timestamp();
        let containers = self
            .list_labelled(format!("{}=true", MANAGED_LABEL))
            .await?;

        let mut removed = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            if !is_reapable(container.state.as_deref(), container.created.unwrap_or(0), cutoff) {
                continue;
            }

            match self.remove(&id).await {
                Ok(()) => removed.push(id),
                Err(e) => warn!("Failed to remove finished job container {}: {}", id, e),
            }
        }

        Ok(removed)
    }
}

/// Container definition for one job with the security profile applied
pub(crate) fn build_container_config(job: &JobSpec) -> Config<String> {
    let profile = &job.security_profile;
    let name = job.job_name();

    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (JOB_LABEL.to_string(), name),
        (EXECUTION_LABEL.to_string(), job.execution_id.to_string()),
        (LANGUAGE_LABEL.to_string(), job.runtime.id.clone()),
    ]);

    // The deadline is enforced inside the container so it holds without us
    let mut cmd = vec![
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        profile.deadline_secs.to_string(),
    ];
    cmd.extend(job.runtime.render_command(&job.source_code));

    let memory_limit = (profile.memory_limit_mb * 1024 * 1024) as i64;
    let host_config = HostConfig {
        cpu_shares: Some((profile.cpu_request * 1024.0) as i64),
        nano_cpus: Some((profile.cpu_limit * 1_000_000_000.0) as i64),
        memory_reservation: Some((profile.memory_request_mb * 1024 * 1024) as i64),
        memory: Some(memory_limit),
        memory_swap: Some(memory_limit),
        pids_limit: Some(profile.pids_limit),
        network_mode: Some(if profile.network_disabled { "none" } else { "bridge" }.to_string()),
        readonly_rootfs: Some(profile.read_only_rootfs),
        tmpfs: profile.read_only_rootfs.then(|| {
            HashMap::from([(
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,size={}m", profile.tmpfs_size_mb),
            )])
        }),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        }),
        cap_drop: Some(vec!["ALL".to_string()]),
        privileged: Some(false),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        auto_remove: Some(false),
        // The workload must not be PID 1, which ignores the deadline's SIGKILL
        init: Some(true),
        ..Default::default()
    };

    Config {
        image: Some(job.runtime.image.clone()),
        cmd: Some(cmd),
        user: Some(profile.run_as.clone()),
        env: Some(vec!["HOME=/tmp".to_string()]),
        working_dir: Some("/tmp".to_string()),
        labels: Some(labels),
        network_disabled: Some(profile.network_disabled),
        tty: Some(false),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Translate the runtime's container state into a job status
pub(crate) fn decode_state(state: &ContainerState) -> JobStatus {
    match &state.status {
        None
        | Some(ContainerStateStatusEnum::EMPTY)
        | Some(ContainerStateStatusEnum::CREATED) => JobStatus::Pending,
        Some(ContainerStateStatusEnum::RUNNING)
        | Some(ContainerStateStatusEnum::RESTARTING)
        | Some(ContainerStateStatusEnum::PAUSED) => JobStatus::Running,
        Some(ContainerStateStatusEnum::EXITED) => match state.exit_code.unwrap_or(-1) {
            0 => JobStatus::Succeeded,
            code => JobStatus::Failed(describe_exit(state, code)),
        },
        Some(ContainerStateStatusEnum::DEAD) => JobStatus::Failed(
            state
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "sandbox container died".to_string()),
        ),
        Some(ContainerStateStatusEnum::REMOVING) => {
            JobStatus::Failed("sandbox container removed before completion".to_string())
        }
    }
}

fn describe_exit(state: &ContainerState, code: i64) -> String {
    if state.oom_killed == Some(true) {
        "OOMKilled: memory limit exceeded".to_string()
    } else if code == 124 || code == 137 {
        "DeadlineExceeded: execution exceeded its time limit".to_string()
    } else {
        format!("exit code {}", code)
    }
}

/// Finished containers older than `cutoff` (unix seconds) may be removed
pub(crate) fn is_reapable(state: Option<&str>, created: i64, cutoff: i64) -> bool {
    matches!(state, Some("exited") | Some("dead")) && created < cutoff
}

pub(crate) fn map_docker_error(error: BollardError, subject: &str) -> OrchestratorError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            400 => OrchestratorError::BadRequest(message),
            404 => OrchestratorError::NotFound(subject.to_string()),
            503 => OrchestratorError::Unavailable(message),
            _ => OrchestratorError::Internal(format!(
                "{} (status {}): {}",
                subject, status_code, message
            )),
        },
        BollardError::RequestTimeoutError => {
            OrchestratorError::Unavailable(format!("Docker request for {} timed out", subject))
        }
        // Remaining variants come from the transport to the daemon
        other => OrchestratorError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageRegistry;
    use crate::orchestrator::SecurityProfile;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn python_job(code: &str) -> JobSpec {
        let registry = LanguageRegistry::new().unwrap();
        JobSpec {
            execution_id: ExecutionId::from("11111111-2222-4333-8444-555555555555"),
            runtime: registry.get("python").unwrap().clone(),
            source_code: code.to_string(),
            security_profile: SecurityProfile::default(),
        }
    }

    #[test]
    fn test_container_config_applies_security_profile() {
        let config = build_container_config(&python_job("print(1+1)"));

        assert_eq!(config.image.as_deref(), Some("python:3.12-alpine"));
        assert_eq!(config.user.as_deref(), Some("65534:65534"));
        assert_eq!(
            config.cmd,
            Some(
                ["timeout", "-s", "KILL", "10", "python", "-c", "print(1+1)"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            )
        );

        let host = config.host_config.unwrap();
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.privileged, Some(false));
        assert_eq!(host.init, Some(true));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.memory_reservation, Some(64 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.cpu_shares, Some(256));
        assert_eq!(host.pids_limit, Some(64));
        assert!(host.tmpfs.unwrap().contains_key("/tmp"));
        assert_eq!(
            host.restart_policy.and_then(|p| p.name),
            Some(RestartPolicyNameEnum::NO)
        );
    }

    #[test]
    fn test_container_config_labels_job() {
        let job = python_job("print(1)");
        let labels = build_container_config(&job).labels.unwrap();

        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(JOB_LABEL), Some(&job.job_name()));
        assert_eq!(labels.get(LANGUAGE_LABEL).map(String::as_str), Some("python"));
    }

    #[test]
    fn test_code_is_passed_as_single_argument() {
        let code = "import os\nprint('a b; rm -rf /')";
        let config = build_container_config(&python_job(code));
        let cmd = config.cmd.unwrap();
        assert_eq!(cmd.last().map(String::as_str), Some(code));
    }

    fn state(status: ContainerStateStatusEnum, exit_code: i64, oom: bool) -> ContainerState {
        ContainerState {
            status: Some(status),
            exit_code: Some(exit_code),
            oom_killed: Some(oom),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(ContainerStateStatusEnum::CREATED, 0, false, JobStatus::Pending)]
    #[case(ContainerStateStatusEnum::RUNNING, 0, false, JobStatus::Running)]
    #[case(ContainerStateStatusEnum::RESTARTING, 0, false, JobStatus::Running)]
    #[case(ContainerStateStatusEnum::PAUSED, 0, false, JobStatus::Running)]
    #[case(ContainerStateStatusEnum::EXITED, 0, false, JobStatus::Succeeded)]
    #[case(ContainerStateStatusEnum::EXITED, 1, false, JobStatus::Failed("exit code 1".to_string()))]
    #[case(
        ContainerStateStatusEnum::EXITED,
        137,
        false,
        JobStatus::Failed("DeadlineExceeded: execution exceeded its time limit".to_string())
    )]
    #[case(
        ContainerStateStatusEnum::EXITED,
        124,
        false,
        JobStatus::Failed("DeadlineExceeded: execution exceeded its time limit".to_string())
    )]
    #[case(
        ContainerStateStatusEnum::EXITED,
        137,
        true,
        JobStatus::Failed("OOMKilled: memory limit exceeded".to_string())
    )]
    #[case(
        ContainerStateStatusEnum::DEAD,
        0,
        false,
        JobStatus::Failed("sandbox container died".to_string())
    )]
    fn test_decode_state(
        #[case] status: ContainerStateStatusEnum,
        #[case] exit_code: i64,
        #[case] oom: bool,
        #[case] expected: JobStatus,
    ) {
        assert_eq!(decode_state(&state(status, exit_code, oom)), expected);
    }

    #[test]
    fn test_decode_missing_state_is_pending() {
        assert_eq!(decode_state(&ContainerState::default()), JobStatus::Pending);
    }

    #[test]
    fn test_is_reapable() {
        assert!(is_reapable(Some("exited"), 100, 200));
        assert!(is_reapable(Some("dead"), 100, 200));
        assert!(!is_reapable(Some("exited"), 300, 200));
        assert!(!is_reapable(Some("running"), 100, 200));
        assert!(!is_reapable(Some("created"), 100, 200));
        assert!(!is_reapable(None, 100, 200));
    }

    #[test]
    fn test_map_docker_error() {
        let err = |status_code| BollardError::DockerResponseServerError {
            status_code,
            message: "boom".to_string(),
        };

        assert_eq!(
            map_docker_error(err(400), "job"),
            OrchestratorError::BadRequest("boom".to_string())
        );
        assert_eq!(
            map_docker_error(err(404), "job"),
            OrchestratorError::NotFound("job".to_string())
        );
        assert!(matches!(
            map_docker_error(err(503), "job"),
            OrchestratorError::Unavailable(_)
        ));
        assert!(matches!(
            map_docker_error(err(500), "job"),
            OrchestratorError::Internal(_)
        ));
        assert!(matches!(
            map_docker_error(BollardError::RequestTimeoutError, "job"),
            OrchestratorError::Unavailable(_)
        ));
    }
}
