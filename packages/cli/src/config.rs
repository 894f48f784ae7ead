// ABOUTME: Server configuration read from the environment
// ABOUTME: Parses and validates listener, store, sandbox limit and reaper settings

use coderun_core::RetryConfig;
use coderun_executions::ExecutionSettings;
use coderun_sandbox::SecurityProfile;
use std::env;
use std::fmt::Display;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub database_url: String,
    /// Replaces the embedded language table when set
    pub languages_file: Option<PathBuf>,
    pub max_source_bytes: usize,
    pub job_deadline_secs: u64,
    pub job_memory_mb: u64,
    pub job_cpu_limit: f64,
    pub job_run_as: String,
    pub pull_timeout: Duration,
    pub retry_max_attempts: u32,
    /// `None` disables the reaper
    pub reaper_interval: Option<Duration>,
    pub reaper_max_age: chrono::Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = lookup("PORT")
            .unwrap_or_else(|| "5000".to_string())
            .trim()
            .parse::<u16>()?;

        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let host = lookup("CODERUN_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let cors_origin = lookup("CORS_ORIGIN").unwrap_or_else(|| "*".to_string());
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://coderun.db".to_string());
        let languages_file = lookup("CODERUN_LANGUAGES_FILE")
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let max_source_bytes = positive(&lookup, "CODERUN_MAX_SOURCE_BYTES", 65536usize)?;
        let job_deadline_secs = positive(&lookup, "CODERUN_JOB_DEADLINE_SECS", 10u64)?;
        let job_memory_mb = positive(&lookup, "CODERUN_JOB_MEMORY_MB", 128u64)?;

        let job_cpu_limit = parse_var(&lookup, "CODERUN_JOB_CPU_LIMIT", 0.5f64)?;
        if !job_cpu_limit.is_finite() || job_cpu_limit <= 0.0 {
            return Err(invalid(
                "CODERUN_JOB_CPU_LIMIT",
                job_cpu_limit,
                "must be a positive number of CPUs",
            ));
        }

        let job_run_as = lookup("CODERUN_JOB_RUN_AS")
            .map(|user| user.trim().to_string())
            .unwrap_or_else(|| "65534:65534".to_string());
        if is_root_identity(&job_run_as) {
            return Err(invalid(
                "CODERUN_JOB_RUN_AS",
                &job_run_as,
                "jobs must run as a non-root user",
            ));
        }

        let pull_timeout_secs = positive(&lookup, "CODERUN_PULL_TIMEOUT_SECS", 300u64)?;
        let retry_max_attempts = positive(&lookup, "CODERUN_RETRY_MAX_ATTEMPTS", 3u32)?;

        let reaper_minutes = parse_var(&lookup, "CODERUN_REAPER_INTERVAL_MINUTES", 0u64)?;
        let reaper_interval_secs = reaper_minutes.checked_mul(60).ok_or_else(|| {
            invalid(
                "CODERUN_REAPER_INTERVAL_MINUTES",
                reaper_minutes,
                "interval is too large",
            )
        })?;

        let reaper_max_age_hours = positive(&lookup, "CODERUN_REAPER_MAX_AGE_HOURS", 24i64)?;
        let reaper_max_age = chrono::Duration::try_hours(reaper_max_age_hours).ok_or_else(|| {
            invalid(
                "CODERUN_REAPER_MAX_AGE_HOURS",
                reaper_max_age_hours,
                "age is too large",
            )
        })?;

        Ok(Config {
            host,
            port,
            cors_origin,
            database_url,
            languages_file,
            max_source_bytes,
            job_deadline_secs,
            job_memory_mb,
            job_cpu_limit,
            job_run_as,
            pull_timeout: Duration::from_secs(pull_timeout_secs),
            retry_max_attempts,
            reaper_interval: (reaper_interval_secs > 0)
                .then(|| Duration::from_secs(reaper_interval_secs)),
            reaper_max_age,
        })
    }

    /// Sandbox limits derived from the configured job settings
    pub fn security_profile(&self) -> SecurityProfile {
        let defaults = SecurityProfile::default();
        SecurityProfile {
            run_as: self.job_run_as.clone(),
            cpu_request: defaults.cpu_request.min(self.job_cpu_limit),
            cpu_limit: self.job_cpu_limit,
            memory_request_mb: defaults.memory_request_mb.min(self.job_memory_mb),
            memory_limit_mb: self.job_memory_mb,
            deadline_secs: self.job_deadline_secs,
            ..defaults
        }
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            security_profile: self.security_profile(),
            max_source_bytes: self.max_source_bytes,
            retry: RetryConfig {
                max_attempts: self.retry_max_attempts,
                ..RetryConfig::default()
            },
            ..ExecutionSettings::default()
        }
    }
}

/// Empty, uid 0 or the `root` name, with or without a group
fn is_root_identity(run_as: &str) -> bool {
    let user = run_as.split(':').next().unwrap_or_default().trim();
    user.is_empty() || user == "root" || user.parse::<u64>() == Ok(0)
}

fn invalid(name: &'static str, value: impl Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| invalid(name, &raw, &e.to_string())),
        None => Ok(default),
    }
}

fn positive<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + Display + Copy,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_var(lookup, name, default)?;
    if value <= T::default() {
        return Err(invalid(name, value, "must be greater than zero"));
    }
    Ok(value)
}
