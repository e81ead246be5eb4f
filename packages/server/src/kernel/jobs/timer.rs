//! Per-job timer: one async task per active job that fires the pipeline
//! on the job's schedule and waits for the run to complete before
//! scheduling the next one.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::errors::SyncError;
use crate::common::status::JobStatus;
use crate::kernel::jobs::job::SyncJob;
use crate::kernel::jobs::store::JobStore;

/// Launches a claimed job into the pipeline (publishes the extraction
/// kickoff). Implemented by the kernel; stubbed in tests.
#[async_trait::async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, job: &SyncJob) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// How often to poll the job row while a run is in flight.
    pub completion_poll_interval: std::time::Duration,
    /// Hard ceiling on how long to wait for a run to complete.
    pub completion_ceiling: std::time::Duration,
    /// Shortest delay allowed between consecutive firings.
    pub min_delay: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            completion_poll_interval: std::time::Duration::from_secs(5),
            completion_ceiling: std::time::Duration::from_secs(3600),
            min_delay: Duration::minutes(1),
        }
    }
}

/// Delay until the first firing. A `next_run` in the past fires
/// immediately rather than skipping the overdue slot.
pub fn initial_delay(job: &SyncJob, now: DateTime<Utc>) -> Duration {
    match job.next_run {
        Some(at) if at > now => at - now,
        _ => Duration::zero(),
    }
}

/// Delay until the following firing, computed after a run completes. When
/// the run overran its slot (the computed delay falls under `min_delay`),
/// fall back to one full interval from now instead of firing in a tight
/// loop.
pub fn next_delay(job: &SyncJob, now: DateTime<Utc>, min_delay: Duration) -> Duration {
    let interval = job.schedule_interval();
    let delay = match job.next_run {
        Some(at) if at > now => at - now,
        _ => Duration::zero(),
    };
    if delay < min_delay {
        interval
    } else {
        delay
    }
}

/// Handle to a spawned timer task.
pub struct TimerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TimerHandle {
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                error!(error = %e, "timer task panicked");
            }
        }
    }
}

pub struct JobTimer {
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn JobLauncher>,
    config: TimerConfig,
    job_id: uuid::Uuid,
    tenant_id: uuid::Uuid,
}

impl JobTimer {
    pub fn new(
        store: Arc<dyn JobStore>,
        launcher: Arc<dyn JobLauncher>,
        config: TimerConfig,
        job: &SyncJob,
    ) -> Self {
        Self {
            store,
            launcher,
            config,
            job_id: job.job_id,
            tenant_id: job.tenant_id,
        }
    }

    pub fn spawn(self) -> TimerHandle {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            self.run(task_token).await;
        });
        TimerHandle { token, handle }
    }

    async fn run(self, token: CancellationToken) {
        let mut first_iteration = true;

        loop {
            // Re-read the job each cycle; schedule changes and pauses made
            // while sleeping take effect on the next firing.
            let job = match self.store.find(self.job_id, self.tenant_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    info!(job_id = %self.job_id, "job deleted, stopping timer");
                    return;
                }
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "failed to read job, retrying in one minute");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => continue,
                    }
                }
            };

            if !job.active {
                info!(job_id = %self.job_id, "job deactivated, stopping timer");
                return;
            }

            let now = Utc::now();
            let delay = if first_iteration {
                if job.next_run.is_none() {
                    // Persist the first firing time so restarts keep the slot.
                    if let Err(e) = self
                        .store
                        .set_next_run(self.job_id, self.tenant_id, now)
                        .await
                    {
                        warn!(job_id = %self.job_id, error = %e, "failed to persist initial next_run");
                    }
                }
                initial_delay(&job, now)
            } else {
                next_delay(&job, now, self.config.min_delay)
            };
            first_iteration = false;

            let sleep_for = delay
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = token.cancelled() => {
                    info!(job_id = %self.job_id, "timer cancelled");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            // Re-read right before firing; the sleep may have been long.
            let job = match self.store.find(self.job_id, self.tenant_id).await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "failed to re-read job before firing");
                    continue;
                }
            };
            if !job.is_due(Utc::now()) {
                continue;
            }

            let started_at = Utc::now();
            match self
                .store
                .try_mark_running(self.job_id, self.tenant_id, started_at)
                .await
            {
                Ok(true) => {
                    info!(job_id = %self.job_id, tenant_id = %self.tenant_id, "launching sync run");
                    // The snapshot predates the claim; stamp this run's start
                    // so the launcher computes the new high-water mark from
                    // the current run, not the previous one.
                    let mut job = job.clone();
                    job.last_run_started_at = Some(started_at);
                    if let Err(e) = self.launcher.launch(&job).await {
                        error!(job_id = %self.job_id, error = %e, "failed to launch run");
                        let parked = if e.is_retryable() {
                            self.store
                                .park_for_retry(self.job_id, self.tenant_id, &e.to_string())
                                .await
                        } else {
                            self.store
                                .mark_failed(self.job_id, self.tenant_id, &e.to_string())
                                .await
                        };
                        if let Err(e) = parked {
                            error!(job_id = %self.job_id, error = %e, "failed to record launch failure");
                        }
                    } else {
                        self.wait_for_completion(&token).await;
                    }
                }
                Ok(false) => {
                    // Another trigger (manual run, or a racing timer after
                    // restart) owns this slot.
                    info!(job_id = %self.job_id, "job already running, skipping this firing");
                    self.wait_for_completion(&token).await;
                }
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "failed to claim job");
                }
            }

            // Persist the next slot from completion time, so long runs do
            // not compress the gap between runs.
            let next_run = Utc::now() + self.interval().await;
            if let Err(e) = self
                .store
                .set_next_run(self.job_id, self.tenant_id, next_run)
                .await
            {
                warn!(job_id = %self.job_id, error = %e, "failed to persist next_run");
            }
        }
    }

    async fn interval(&self) -> Duration {
        match self.store.find(self.job_id, self.tenant_id).await {
            Ok(Some(job)) => job.schedule_interval(),
            _ => Duration::minutes(60),
        }
    }

    /// Poll the job row until the run leaves RUNNING. Bounded by the
    /// completion ceiling; on timeout we log and move on rather than
    /// blocking the schedule forever.
    async fn wait_for_completion(&self, token: &CancellationToken) {
        let deadline = tokio::time::Instant::now() + self.config.completion_ceiling;

        // Check before the first sleep: short runs finish while the
        // kickoff is still in flight.
        loop {
            match self.store.find(self.job_id, self.tenant_id).await {
                Ok(Some(job)) if job.status != JobStatus::Running => return,
                Ok(None) => return,
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "failed to poll run completion");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(job_id = %self.job_id, "run did not complete within the ceiling, resuming schedule");
                return;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.completion_poll_interval) => {}
            }
        }
    }
}
