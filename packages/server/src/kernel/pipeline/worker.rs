//! Stage worker: pulls messages off one (stage, tier) queue and drives
//! them through the stage handler, the status broadcast, and job
//! finalization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::errors::SyncError;
use crate::common::status::StepState;
use crate::kernel::jobs::job::JobOutcome;
use crate::kernel::pipeline::message::{StageMessage, StageType};
use crate::kernel::pipeline::router::queue_name;
use crate::kernel::sync_kernel::SyncKernel;

/// What a handler did with one work item.
pub enum StageOutcome {
    /// Forward the given unit reference to the next stage.
    Forward(String),
    /// Work complete at this stage; nothing to forward (terminal stage,
    /// or a benign no-op like a deleted entity).
    Done,
    /// The handler emitted its own messages (extraction fan-out); the
    /// worker must not forward anything for this message.
    FannedOut,
}

/// One pipeline stage's processing logic.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageType;
    async fn process(&self, message: &StageMessage) -> Result<StageOutcome, SyncError>;
}

#[derive(Debug, Clone)]
pub struct StageWorkerConfig {
    pub tier: crate::kernel::jobs::job::ServiceTier,
    /// Sleep between polls when the queue is empty.
    pub idle_backoff: Duration,
    pub worker_id: String,
}

impl StageWorkerConfig {
    pub fn new(tier: crate::kernel::jobs::job::ServiceTier, stage: StageType) -> Self {
        Self {
            tier,
            idle_backoff: Duration::from_millis(250),
            worker_id: format!("{}-{}", stage.as_str(), tier.as_str()),
        }
    }
}

pub struct StageWorker {
    kernel: SyncKernel,
    handler: Arc<dyn StageHandler>,
    config: StageWorkerConfig,
}

impl StageWorker {
    pub fn new(kernel: SyncKernel, handler: Arc<dyn StageHandler>, config: StageWorkerConfig) -> Self {
        Self {
            kernel,
            handler,
            config,
        }
    }

    pub fn queue(&self) -> String {
        queue_name(self.handler.stage(), self.config.tier)
    }

    /// Pull and process one message. Returns `Ok(false)` when the queue
    /// was empty. Message-level failures are absorbed here (logged and
    /// recorded on the job); only store/broker failures surface.
    pub async fn process_next(&self) -> Result<bool, SyncError> {
        let queue = self.queue();
        let Some(payload) = self.kernel.broker.try_receive(&queue).await? else {
            return Ok(false);
        };

        let message = match StageMessage::decode(&payload) {
            Ok(m) => m,
            Err(e) => {
                // Undecodable payloads are dropped; retrying cannot fix them.
                error!(queue = %queue, error = %e, "dropping undecodable stage message");
                return Ok(true);
            }
        };

        if let Err(e) = self.handle_message(&message).await {
            error!(
                worker = %self.config.worker_id,
                job_id = %message.job_id,
                error = %e,
                "stage message failed"
            );
            self.record_failure(&message, &e).await;
        }
        Ok(true)
    }

    /// Poll loop used in production; cancellation stops between messages.
    pub async fn run(&self, token: CancellationToken) {
        info!(worker = %self.config.worker_id, queue = %self.queue(), "stage worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(worker = %self.config.worker_id, "stage worker stopped");
                    return;
                }
                result = self.process_next() => {
                    match result {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::time::sleep(self.config.idle_backoff).await;
                        }
                        Err(e) => {
                            warn!(worker = %self.config.worker_id, error = %e, "queue receive failed");
                            tokio::time::sleep(self.config.idle_backoff).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: &StageMessage) -> Result<(), SyncError> {
        let stage = self.handler.stage();

        // Sentinels on non-initial stages carry completion, not work. The
        // initial stage's sentinel is the kickoff and goes to the handler.
        if message.is_sentinel() && !stage.is_initial() {
            return self.handle_sentinel(message).await;
        }

        if message.first_item {
            self.kernel
                .broadcast_stage_status(message, StepState::Running)
                .await?;
        }

        let outcome = match self.handler.process(message).await {
            Ok(outcome) => outcome,
            Err(SyncError::NotFound(what)) => {
                // Source entity vanished mid-run; skip it as a success so
                // the run can still complete.
                debug!(job_id = %message.job_id, what = %what, "unit vanished, skipping");
                StageOutcome::Done
            }
            Err(e @ SyncError::FatalConfig(_)) => return Err(e),
            Err(SyncError::RateLimited(why)) if !stage.is_initial() => {
                // A throttled provider ends the run RATE_LIMITED so the
                // window is retried, never skipped as an ordinary failure.
                warn!(
                    job_id = %message.job_id,
                    stage = stage.as_str(),
                    why = %why,
                    "rate limited mid-stage"
                );
                return self.close_rate_limited(message).await;
            }
            Err(e) if !stage.is_initial() => {
                // Past enumeration, one bad unit must not abort the run.
                // The skipped unit converges on the next incremental pass.
                warn!(
                    job_id = %message.job_id,
                    stage = stage.as_str(),
                    error = %e,
                    "unit failed, skipping"
                );
                StageOutcome::Done
            }
            Err(e) => return Err(e),
        };

        match outcome {
            StageOutcome::Forward(unit_reference) => {
                if let Some(next) = stage.next() {
                    let forwarded = message.for_next_stage(next, unit_reference);
                    self.kernel.publish_message(&forwarded).await?;
                }
            }
            StageOutcome::Done => {
                // A completed unit carrying the last flags must still close
                // out the downstream stages, otherwise the run would hang.
                if message.last_item {
                    if let Some(next) = stage.next() {
                        self.kernel
                            .publish_message(&message.sentinel_for_next_stage(next))
                            .await?;
                    }
                }
            }
            StageOutcome::FannedOut => {}
        }

        if message.last_item {
            self.kernel
                .broadcast_stage_status(message, StepState::Finished)
                .await?;
        }

        // Terminal stage: the message carrying last_job_item finalizes.
        if stage.next().is_none() && message.last_job_item {
            self.kernel
                .finalize_job(message, outcome_from_flags(message))
                .await?;
        }

        Ok(())
    }

    /// Completion sentinel on a non-initial stage: mark the stage
    /// finished, forward the sentinel, and finalize at the terminal stage.
    async fn handle_sentinel(&self, message: &StageMessage) -> Result<(), SyncError> {
        let stage = self.handler.stage();
        debug!(
            job_id = %message.job_id,
            stage = stage.as_str(),
            "completion sentinel received"
        );

        if message.last_item {
            self.kernel
                .broadcast_stage_status(message, StepState::Finished)
                .await?;
        }

        match stage.next() {
            Some(next) => {
                self.kernel
                    .publish_message(&message.sentinel_for_next_stage(next))
                    .await?;
            }
            None => {
                if message.last_job_item {
                    self.kernel
                        .finalize_job(message, outcome_from_flags(message))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// End the run with the RATE_LIMITED outcome: `last_sync_date` stays
    /// untouched so the next scheduled run retries the same window. The
    /// terminal stage finalizes directly; earlier stages send a
    /// rate-limited sentinel carrying the terminal flags downstream.
    async fn close_rate_limited(&self, message: &StageMessage) -> Result<(), SyncError> {
        self.kernel
            .broadcast_stage_status(message, StepState::RateLimited)
            .await?;

        match self.handler.stage().next() {
            None => {
                self.kernel
                    .finalize_job(message, JobOutcome::RateLimited)
                    .await?;
            }
            Some(next) => {
                let mut sentinel = message.sentinel_for_next_stage(next);
                sentinel.last_item = true;
                sentinel.last_job_item = true;
                sentinel.rate_limited = true;
                self.kernel.publish_message(&sentinel).await?;
            }
        }
        Ok(())
    }

    /// Record a failed message on the job. Fatal configuration errors
    /// fail the job outright; everything else parks it PENDING with its
    /// checkpoint for the next scheduling cycle.
    async fn record_failure(&self, message: &StageMessage, error: &SyncError) {
        let result = match error {
            SyncError::FatalConfig(_) => {
                self.kernel
                    .store
                    .mark_failed(message.job_id, message.tenant_id, &error.to_string())
                    .await
            }
            _ => {
                self.kernel
                    .store
                    .park_for_retry(message.job_id, message.tenant_id, &error.to_string())
                    .await
            }
        };
        if let Err(e) = result {
            error!(job_id = %message.job_id, error = %e, "failed to record stage failure");
        }
    }
}

fn outcome_from_flags(message: &StageMessage) -> JobOutcome {
    if message.rate_limited {
        JobOutcome::RateLimited
    } else {
        JobOutcome::Finished
    }
}
