//! Timer manager: owns one timer task per active job.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::common::errors::SyncError;
use crate::kernel::jobs::store::JobStore;
use crate::kernel::jobs::timer::{JobLauncher, JobTimer, TimerConfig, TimerHandle};

pub struct JobTimerManager {
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn JobLauncher>,
    config: TimerConfig,
    timers: Mutex<HashMap<Uuid, TimerHandle>>,
}

impl JobTimerManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        launcher: Arc<dyn JobLauncher>,
        config: TimerConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            config,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a timer for every active job. A failure to start one timer
    /// does not prevent the others from starting.
    pub async fn start_all(&self) -> Result<usize, SyncError> {
        let jobs = self.store.find_active().await?;
        let mut timers = self.timers.lock().await;
        let mut started = 0;

        for job in &jobs {
            if timers.contains_key(&job.job_id) {
                continue;
            }
            let timer = JobTimer::new(
                Arc::clone(&self.store),
                Arc::clone(&self.launcher),
                self.config.clone(),
                job,
            );
            timers.insert(job.job_id, timer.spawn());
            started += 1;
        }

        info!(count = started, "started job timers");
        Ok(started)
    }

    /// Start (or restart) the timer for a single job, e.g. after creation
    /// or reactivation.
    pub async fn start(&self, job_id: Uuid, tenant_id: Uuid) -> Result<(), SyncError> {
        let job = self
            .store
            .find(job_id, tenant_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("job {job_id}")))?;

        let mut timers = self.timers.lock().await;
        if let Some(existing) = timers.remove(&job_id) {
            existing.stop().await;
        }
        let timer = JobTimer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.launcher),
            self.config.clone(),
            &job,
        );
        timers.insert(job_id, timer.spawn());
        Ok(())
    }

    pub async fn stop(&self, job_id: Uuid) {
        let handle = self.timers.lock().await.remove(&job_id);
        if let Some(handle) = handle {
            handle.stop().await;
            info!(job_id = %job_id, "stopped job timer");
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = {
            let mut timers = self.timers.lock().await;
            timers.drain().collect()
        };
        for (job_id, handle) in handles {
            handle.stop().await;
            info!(job_id = %job_id, "stopped job timer");
        }
    }

    pub async fn timer_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

impl Drop for JobTimerManager {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.try_lock() {
            if !timers.is_empty() {
                error!(
                    count = timers.len(),
                    "timer manager dropped with running timers; call stop_all first"
                );
            }
        }
    }
}
