//! Extraction stage: enumerate changed entities in the source system,
//! capture their payloads, and fan work out to the transform stage.
//!
//! Enumeration and fan-out are both checkpointed. Pagination cursors are
//! persisted per page, and each unit's completion flag flips only after
//! its downstream message is published, so a resumed run re-queries
//! nothing it already covered and re-emits only unfinished units.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::common::errors::SyncError;
use crate::kernel::jobs::checkpoint::{RecoveryCheckpoint, WorkUnit};
use crate::kernel::jobs::job::SyncJob;
use crate::kernel::pipeline::message::{EntityKind, StageMessage, StageType};
use crate::kernel::pipeline::unit_store::RawUnit;
use crate::kernel::pipeline::worker::{StageHandler, StageOutcome};
use crate::kernel::sync_kernel::SyncKernel;

const ITEMS_CURSOR: &str = "items";

#[derive(Debug, Clone)]
pub struct SourceItem {
    pub external_id: String,
    pub entity_kind: EntityKind,
}

#[derive(Debug, Clone)]
pub struct SourcePage {
    pub items: Vec<SourceItem>,
    pub next_cursor: Option<String>,
}

/// Client for the external tracker API.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// One page of entities changed since `since` (all entities when
    /// `since` is `None`, i.e. the first-ever run).
    async fn list(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<SourcePage, SyncError>;

    /// Full payload for one entity.
    async fn fetch_detail(&self, external_id: &str) -> Result<serde_json::Value, SyncError>;
}

pub struct ExtractionHandler {
    kernel: SyncKernel,
    source: Arc<dyn SourceClient>,
}

impl ExtractionHandler {
    pub fn new(kernel: SyncKernel, source: Arc<dyn SourceClient>) -> Self {
        Self { kernel, source }
    }

    /// Enumerate the incremental window into the checkpoint, persisting
    /// after every page. Resumes from the saved cursor when present.
    async fn enumerate(
        &self,
        message: &StageMessage,
        checkpoint: &mut RecoveryCheckpoint,
    ) -> Result<(), SyncError> {
        let since = message.old_checkpoint;
        loop {
            let cursor = checkpoint.cursor(ITEMS_CURSOR).map(str::to_owned);
            let page = self.source.list(since, cursor.as_deref()).await?;

            for item in &page.items {
                checkpoint.push_unit(&item.external_id, item.entity_kind);
            }
            match &page.next_cursor {
                Some(next) => checkpoint.set_cursor(ITEMS_CURSOR, next),
                None => checkpoint.clear_cursor(ITEMS_CURSOR),
            }
            self.kernel
                .store
                .save_checkpoint(message.job_id, message.tenant_id, checkpoint)
                .await?;

            if page.next_cursor.is_none() {
                return Ok(());
            }
        }
    }

    /// Capture payloads for every unfinished unit. Vanished entities are
    /// marked finished and dropped so the emission count is exact before
    /// any position flags are assigned.
    async fn capture(
        &self,
        message: &StageMessage,
        units: Vec<WorkUnit>,
    ) -> Result<Vec<(WorkUnit, RawUnit)>, SyncError> {
        let mut captured = Vec::with_capacity(units.len());
        for unit in units {
            match self.source.fetch_detail(&unit.unit_id).await {
                Ok(payload) => {
                    let raw = RawUnit::new(
                        message.tenant_id,
                        message.job_id,
                        unit.entity_kind,
                        unit.unit_id.clone(),
                        payload,
                    );
                    self.kernel.units.store_raw(&raw).await?;
                    captured.push((unit, raw));
                }
                Err(SyncError::NotFound(_)) => {
                    debug!(unit_id = %unit.unit_id, "entity vanished before capture, skipping");
                    self.kernel
                        .store
                        .mark_unit_finished(message.job_id, message.tenant_id, &unit.unit_id)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(captured)
    }

    /// Close the run from the extraction side with a completion sentinel.
    /// Used when there is nothing (left) to emit, or when a rate limit
    /// ends the run early.
    async fn emit_sentinel(
        &self,
        message: &StageMessage,
        first: bool,
        rate_limited: bool,
    ) -> Result<(), SyncError> {
        let mut sentinel = message.sentinel_for_next_stage(StageType::Transform);
        sentinel.first_item = first;
        sentinel.last_item = true;
        sentinel.last_job_item = true;
        sentinel.rate_limited = rate_limited;
        self.kernel.publish_message(&sentinel).await
    }
}

#[async_trait]
impl StageHandler for ExtractionHandler {
    fn stage(&self) -> StageType {
        StageType::Extraction
    }

    async fn process(&self, message: &StageMessage) -> Result<StageOutcome, SyncError> {
        let job: SyncJob = self
            .kernel
            .store
            .find(message.job_id, message.tenant_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("job {}", message.job_id)))?;

        let mut checkpoint = match job.recovery_checkpoint()? {
            Some(cp) if !cp.is_empty() => {
                info!(
                    job_id = %message.job_id,
                    pending = cp.unfinished().len(),
                    "resuming interrupted run from checkpoint"
                );
                cp
            }
            _ => RecoveryCheckpoint::new(message.new_checkpoint),
        };

        // Enumeration is still in progress while a cursor is saved; a
        // fresh checkpoint has neither cursor nor queue.
        if checkpoint.cursor(ITEMS_CURSOR).is_some() || checkpoint.is_empty() {
            match self.enumerate(message, &mut checkpoint).await {
                Ok(()) => {}
                Err(SyncError::RateLimited(why)) => {
                    warn!(job_id = %message.job_id, why = %why, "rate limited during enumeration");
                    self.emit_sentinel(message, true, true).await?;
                    return Ok(StageOutcome::FannedOut);
                }
                Err(e) => return Err(e),
            }
        }

        let pending = checkpoint.unfinished();
        if pending.is_empty() {
            // Zero units this window (or all finished before the crash).
            self.emit_sentinel(message, true, false).await?;
            return Ok(StageOutcome::FannedOut);
        }

        let captured = match self.capture(message, pending).await {
            Ok(captured) => captured,
            Err(SyncError::RateLimited(why)) => {
                warn!(job_id = %message.job_id, why = %why, "rate limited during capture");
                self.emit_sentinel(message, true, true).await?;
                return Ok(StageOutcome::FannedOut);
            }
            Err(e) => return Err(e),
        };

        if captured.is_empty() {
            // Every pending unit had vanished.
            self.emit_sentinel(message, true, false).await?;
            return Ok(StageOutcome::FannedOut);
        }

        let total = captured.len();
        for (position, (unit, raw)) in captured.into_iter().enumerate() {
            let mut next = message.for_next_stage(StageType::Transform, raw.id.to_string());
            next.entity_kind = unit.entity_kind;
            next.first_item = position == 0;
            next.last_item = position == total - 1;
            next.last_job_item = position == total - 1;
            next.rate_limited = false;

            self.kernel.publish_message(&next).await?;
            self.kernel
                .store
                .mark_unit_finished(message.job_id, message.tenant_id, &unit.unit_id)
                .await?;
        }

        info!(job_id = %message.job_id, units = total, "extraction fan-out complete");
        Ok(StageOutcome::FannedOut)
    }
}
