//! The kernel aggregate: shared handles every pipeline component needs.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::common::broker::Broker;
use crate::common::errors::SyncError;
use crate::common::status::{status_update_frame, StepState};
use crate::kernel::jobs::job::{JobOutcome, SyncJob};
use crate::kernel::jobs::store::JobStore;
use crate::kernel::jobs::timer::JobLauncher;
use crate::kernel::pipeline::message::{StageMessage, StageType};
use crate::kernel::pipeline::router::TierRouter;
use crate::kernel::pipeline::unit_store::UnitStore;
use crate::kernel::status_hub::{self, StatusHub};

#[derive(Clone)]
pub struct SyncKernel {
    pub store: Arc<dyn JobStore>,
    pub units: Arc<dyn UnitStore>,
    pub broker: Arc<dyn Broker>,
    pub hub: Arc<StatusHub>,
    router: Arc<TierRouter>,
}

impl SyncKernel {
    pub fn new(
        store: Arc<dyn JobStore>,
        units: Arc<dyn UnitStore>,
        broker: Arc<dyn Broker>,
        hub: Arc<StatusHub>,
    ) -> Self {
        let router = Arc::new(TierRouter::new(Arc::clone(&store)));
        Self {
            store,
            units,
            broker,
            hub,
            router,
        }
    }

    /// Publish a stage message onto the queue for the tenant's tier.
    pub async fn publish_message(&self, message: &StageMessage) -> Result<(), SyncError> {
        let queue = self
            .router
            .queue_for(message.tenant_id, message.stage_type)
            .await?;
        self.broker.publish(&queue, message.encode()?).await
    }

    /// Update one stage's status on the job row and broadcast the new
    /// document to observers of that (tenant, job, stage) topic.
    pub async fn broadcast_stage_status(
        &self,
        message: &StageMessage,
        state: StepState,
    ) -> Result<(), SyncError> {
        let doc = self
            .store
            .update_stage_status(
                message.job_id,
                message.tenant_id,
                message.stage_type,
                state,
            )
            .await?;
        let frame = status_update_frame(&doc, Utc::now());
        self.hub.publish(
            &status_hub::topic(message.tenant_id, message.job_id, message.stage_type),
            frame,
        );
        Ok(())
    }

    /// Finalize the job run; duplicate sentinels lose the guarded update
    /// and return without side effects. Broadcasts the terminal document
    /// on the finalizing stage's topic when this call wins.
    pub async fn finalize_job(
        &self,
        message: &StageMessage,
        outcome: JobOutcome,
    ) -> Result<bool, SyncError> {
        let won = self
            .store
            .finalize(
                message.job_id,
                message.tenant_id,
                message.new_checkpoint,
                outcome,
            )
            .await?;
        if won {
            info!(
                job_id = %message.job_id,
                tenant_id = %message.tenant_id,
                outcome = ?outcome,
                "job run finalized"
            );
            if let Some(job) = self.store.find(message.job_id, message.tenant_id).await? {
                let doc = job.status_document()?;
                let frame = status_update_frame(&doc, Utc::now());
                self.hub.publish(
                    &status_hub::topic(message.tenant_id, message.job_id, message.stage_type),
                    frame,
                );
            }
        }
        Ok(won)
    }
}

/// Launcher used by job timers: a claimed job enters the pipeline as an
/// extraction kickoff message on the tenant's extraction queue.
pub struct PipelineLauncher {
    kernel: SyncKernel,
}

impl PipelineLauncher {
    pub fn new(kernel: SyncKernel) -> Self {
        Self { kernel }
    }
}

#[async_trait::async_trait]
impl JobLauncher for PipelineLauncher {
    async fn launch(&self, job: &SyncJob) -> Result<(), SyncError> {
        // Resumed runs keep the checkpoint's run-start timestamp so the
        // high-water mark still reflects where the interrupted run began.
        let new_checkpoint = match job.recovery_checkpoint()? {
            Some(cp) if !cp.is_empty() => cp.run_started_at,
            _ => job.last_run_started_at.unwrap_or_else(Utc::now),
        };

        let kickoff = StageMessage {
            tenant_id: job.tenant_id,
            job_id: job.job_id,
            integration_id: job.integration_id,
            stage_type: StageType::Extraction,
            entity_kind: crate::kernel::pipeline::message::EntityKind::Issue,
            unit_reference: None,
            old_checkpoint: job.last_sync_date,
            new_checkpoint,
            first_item: true,
            last_item: true,
            last_job_item: false,
            rate_limited: false,
        };
        self.kernel.publish_message(&kickoff).await
    }
}
