// ABOUTME: Background garbage collection of finished sandbox jobs
// ABOUTME: Periodically removes exited job containers older than a configured age

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::orchestrator::Result;

/// Backends able to remove finished jobs in bulk
#[async_trait]
pub trait JobPruner: Send + Sync {
    /// Remove finished jobs created more than `max_age` ago, returning their ids
    async fn prune_finished_jobs(&self, max_age: chrono::Duration) -> Result<Vec<String>>;
}

pub struct JobReaper {
    pruner: Arc<dyn JobPruner>,
    interval: Duration,
    max_age: chrono::Duration,
}

impl JobReaper {
    pub fn new(pruner: Arc<dyn JobPruner>, interval: Duration, max_age: chrono::Duration) -> Self {
        Self {
            pruner,
            interval,
            max_age,
        }
    }

    /// Run one pass, returning how many jobs were removed
    pub async fn sweep(&self) -> usize {
        match self.pruner.prune_finished_jobs(self.max_age).await {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!(
                        "Removed {} finished sandbox jobs: {:?}",
                        removed.len(),
                        removed
                    );
                }
                removed.len()
            }
            Err(e) => {
                error!("Error during sandbox job cleanup: {}", e);
                0
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                "Started sandbox job reaper (interval: {:?}, max age: {}h)",
                self.interval,
                self.max_age.num_hours()
            );

            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPruner {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobPruner for CountingPruner {
        async fn prune_finished_jobs(&self, _max_age: chrono::Duration) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(OrchestratorError::Unavailable("docker down".to_string()))
            } else {
                Ok(vec!["a".to_string(), "b".to_string()])
            }
        }
    }

    #[tokio::test]
    async fn test_sweep_reports_removed() {
        let pruner = Arc::new(CountingPruner {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let reaper = JobReaper::new(pruner.clone(), Duration::from_secs(60), chrono::Duration::hours(24));
        assert_eq!(reaper.sweep().await, 2);
        assert_eq!(pruner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sweep_survives_errors() {
        let pruner = Arc::new(CountingPruner {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let reaper = JobReaper::new(pruner, Duration::from_secs(60), chrono::Duration::hours(24));
        assert_eq!(reaper.sweep().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_runs_on_interval() {
        let pruner = Arc::new(CountingPruner {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let handle = JobReaper::new(pruner.clone(), Duration::from_secs(60), chrono::Duration::hours(1)).spawn();

        // First tick fires immediately, then once per interval
        tokio::time::sleep(Duration::from_secs(125)).await;
        handle.abort();

        assert_eq!(pruner.calls.load(Ordering::SeqCst), 3);
    }
}
