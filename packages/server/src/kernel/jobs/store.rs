//! Job store: persistence and guarded state transitions for sync jobs.
//!
//! The job row is the single serialization point for a job. Every state
//! transition goes through a conditional update guarded by the expected
//! prior status, so two concurrent callers (timer + manual trigger, or
//! duplicate terminal sentinels) resolve to exactly one winner.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::common::errors::SyncError;
use crate::common::status::{JobStatus, JobStatusDoc, StepState};
use crate::kernel::jobs::checkpoint::RecoveryCheckpoint;
use crate::kernel::jobs::job::{JobOutcome, ServiceTier, SyncJob};
use crate::kernel::pipeline::message::StageType;

const JOB_COLUMNS: &str = r#"job_id, tenant_id, integration_id, job_name, source_type, status, active,
       schedule_interval_minutes, next_run, last_run_started_at, last_run_finished_at,
       last_sync_date, error_message, retry_count, status_doc, checkpoint,
       created_at, updated_at"#;

/// Trait for job persistence and guarded transitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All active jobs (timer manager startup).
    async fn find_active(&self) -> Result<Vec<SyncJob>, SyncError>;

    async fn find(&self, job_id: Uuid, tenant_id: Uuid) -> Result<Option<SyncJob>, SyncError>;

    /// Guarded PENDING/READY → RUNNING transition. Returns `false` when
    /// another trigger already claimed the job (zero rows affected).
    async fn try_mark_running(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, SyncError>;

    async fn set_next_run(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        next_run: DateTime<Utc>,
    ) -> Result<(), SyncError>;

    /// Persist the recovery checkpoint for an in-flight run.
    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        checkpoint: &RecoveryCheckpoint,
    ) -> Result<(), SyncError>;

    /// Flip one unit's `finished` flag in the persisted checkpoint.
    /// Idempotent: an already-finished or unknown unit is a no-op.
    async fn mark_unit_finished(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        unit_id: &str,
    ) -> Result<(), SyncError>;

    /// Park the job PENDING with its current checkpoint and an incremented
    /// retry count; the next scheduling cycle resumes from the checkpoint.
    async fn park_for_retry(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        error: &str,
    ) -> Result<(), SyncError>;

    /// Mark the job FAILED (fatal error; no automatic retry).
    async fn mark_failed(&self, job_id: Uuid, tenant_id: Uuid, error: &str)
        -> Result<(), SyncError>;

    /// Terminal transition, guarded on RUNNING so duplicate terminal
    /// sentinels cannot double-finalize. Atomically sets the outcome
    /// status, clears the checkpoint, records `last_run_finished_at`, and
    /// advances `last_sync_date` only for a FINISHED outcome. Returns
    /// `false` when the job was already finalized.
    async fn finalize(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        new_checkpoint: DateTime<Utc>,
        outcome: JobOutcome,
    ) -> Result<bool, SyncError>;

    /// Update one stage's entry in the status document and return the new
    /// document (for broadcasting).
    async fn update_stage_status(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        stage: StageType,
        state: StepState,
    ) -> Result<JobStatusDoc, SyncError>;

    /// Resolve a tenant's service tier; unknown tenants default to free.
    async fn tenant_tier(&self, tenant_id: Uuid) -> Result<ServiceTier, SyncError>;
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn find_active(&self) -> Result<Vec<SyncJob>, SyncError> {
        let jobs = sqlx::query_as::<_, SyncJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE active = true ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn find(&self, job_id: Uuid, tenant_id: Uuid) -> Result<Option<SyncJob>, SyncError> {
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_id = $1 AND tenant_id = $2"
        ))
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn try_mark_running(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'running',
                last_run_started_at = $3,
                error_message = NULL,
                status_doc = jsonb_set(
                    COALESCE(status_doc, '{"overall":"pending","steps":{}}'::jsonb),
                    '{overall}', '"running"'),
                updated_at = NOW()
            WHERE job_id = $1 AND tenant_id = $2
              AND active = true
              AND status <> 'running'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_next_run(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        next_run: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET next_run = $3, updated_at = NOW()
            WHERE job_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(next_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        checkpoint: &RecoveryCheckpoint,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET checkpoint = $3, updated_at = NOW()
            WHERE job_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(serde_json::to_value(checkpoint)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_unit_finished(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        unit_id: &str,
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
            "SELECT checkpoint FROM sync_jobs WHERE job_id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((Some(value),)) = row {
            let mut checkpoint: RecoveryCheckpoint = serde_json::from_value(value)?;
            if checkpoint.mark_finished(unit_id) {
                sqlx::query(
                    r#"
                    UPDATE sync_jobs
                    SET checkpoint = $3, updated_at = NOW()
                    WHERE job_id = $1 AND tenant_id = $2
                    "#,
                )
                .bind(job_id)
                .bind(tenant_id)
                .bind(serde_json::to_value(&checkpoint)?)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn park_for_retry(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        error: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                error_message = $3,
                status_doc = jsonb_set(
                    COALESCE(status_doc, '{"overall":"pending","steps":{}}'::jsonb),
                    '{overall}', '"pending"'),
                updated_at = NOW()
            WHERE job_id = $1 AND tenant_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        error: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed',
                error_message = $3,
                last_run_finished_at = NOW(),
                status_doc = jsonb_set(
                    COALESCE(status_doc, '{"overall":"pending","steps":{}}'::jsonb),
                    '{overall}', '"failed"'),
                updated_at = NOW()
            WHERE job_id = $1 AND tenant_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        new_checkpoint: DateTime<Utc>,
        outcome: JobOutcome,
    ) -> Result<bool, SyncError> {
        let status = outcome.as_status();
        let advances = matches!(outcome, JobOutcome::Finished);

        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = $3,
                status_doc = jsonb_set(
                    COALESCE(status_doc, '{"overall":"pending","steps":{}}'::jsonb),
                    '{overall}', to_jsonb($4::text)),
                checkpoint = NULL,
                last_run_finished_at = NOW(),
                last_sync_date = CASE WHEN $5 THEN $6 ELSE last_sync_date END,
                error_message = NULL,
                retry_count = CASE WHEN $5 THEN 0 ELSE retry_count END,
                updated_at = NOW()
            WHERE job_id = $1 AND tenant_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(status)
        .bind(match status {
            JobStatus::RateLimited => "rate_limited",
            _ => "finished",
        })
        .bind(advances)
        .bind(new_checkpoint)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_stage_status(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        stage: StageType,
        state: StepState,
    ) -> Result<JobStatusDoc, SyncError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(JobStatus, serde_json::Value)> = sqlx::query_as(
            "SELECT status, COALESCE(status_doc, 'null'::jsonb) FROM sync_jobs
             WHERE job_id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (status, doc_value) = match row {
            Some(r) => r,
            None => {
                return Err(SyncError::NotFound(format!(
                    "job {job_id} for tenant {tenant_id}"
                )))
            }
        };

        let mut doc = JobStatusDoc::from_value(&doc_value)?;
        doc.overall = status;
        doc.set_step(stage.as_str(), state);

        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status_doc = $3, updated_at = NOW()
            WHERE job_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(doc.to_value()?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(doc)
    }

    async fn tenant_tier(&self, tenant_id: Uuid) -> Result<ServiceTier, SyncError> {
        let tier: Option<ServiceTier> =
            sqlx::query_scalar("SELECT tier FROM tenants WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(tier.unwrap_or_else(|| {
            debug!(tenant_id = %tenant_id, "unknown tenant, defaulting to free tier");
            ServiceTier::Free
        }))
    }
}

// ============================================================================
// In-memory implementation (tests and single-process runs)
// ============================================================================

/// In-memory job store with the same guarded-transition semantics as the
/// Postgres store. Each method takes the write lock for the whole
/// transition, so claims and finalizations are atomic.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<(Uuid, Uuid), SyncJob>>,
    tiers: RwLock<HashMap<Uuid, ServiceTier>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: SyncJob) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((job.job_id, job.tenant_id), job);
    }

    pub fn set_tenant_tier(&self, tenant_id: Uuid, tier: ServiceTier) {
        self.tiers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant_id, tier);
    }

    /// Snapshot of a job for assertions.
    pub fn get(&self, job_id: Uuid, tenant_id: Uuid) -> Option<SyncJob> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(job_id, tenant_id))
            .cloned()
    }

    fn with_job<T>(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        f: impl FnOnce(&mut SyncJob) -> T,
    ) -> Result<T, SyncError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(&(job_id, tenant_id))
            .ok_or_else(|| SyncError::NotFound(format!("job {job_id} for tenant {tenant_id}")))?;
        let out = f(job);
        job.updated_at = Utc::now();
        Ok(out)
    }

    fn set_overall(job: &mut SyncJob, status: JobStatus) -> Result<(), SyncError> {
        job.status = status;
        let mut doc = job.status_document()?;
        doc.overall = status;
        job.status_doc = doc.to_value()?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find_active(&self) -> Result<Vec<SyncJob>, SyncError> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|j| j.active)
            .cloned()
            .collect())
    }

    async fn find(&self, job_id: Uuid, tenant_id: Uuid) -> Result<Option<SyncJob>, SyncError> {
        Ok(self.get(job_id, tenant_id))
    }

    async fn try_mark_running(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        self.with_job(job_id, tenant_id, |job| {
            if !job.active || job.status == JobStatus::Running {
                return Ok(false);
            }
            Self::set_overall(job, JobStatus::Running)?;
            job.last_run_started_at = Some(started_at);
            job.error_message = None;
            Ok(true)
        })?
    }

    async fn set_next_run(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        next_run: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.with_job(job_id, tenant_id, |job| {
            job.next_run = Some(next_run);
        })
    }

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        checkpoint: &RecoveryCheckpoint,
    ) -> Result<(), SyncError> {
        let value = serde_json::to_value(checkpoint)?;
        self.with_job(job_id, tenant_id, |job| {
            job.checkpoint = Some(value);
        })
    }

    async fn mark_unit_finished(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        unit_id: &str,
    ) -> Result<(), SyncError> {
        self.with_job(job_id, tenant_id, |job| {
            let Some(value) = job.checkpoint.clone() else {
                return Ok(());
            };
            let mut checkpoint: RecoveryCheckpoint = serde_json::from_value(value)?;
            if checkpoint.mark_finished(unit_id) {
                job.checkpoint = Some(serde_json::to_value(&checkpoint)?);
            }
            Ok(())
        })?
    }

    async fn park_for_retry(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        error: &str,
    ) -> Result<(), SyncError> {
        self.with_job(job_id, tenant_id, |job| {
            if job.status != JobStatus::Running {
                return Ok(());
            }
            Self::set_overall(job, JobStatus::Pending)?;
            job.retry_count += 1;
            job.error_message = Some(error.to_string());
            Ok(())
        })?
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        error: &str,
    ) -> Result<(), SyncError> {
        self.with_job(job_id, tenant_id, |job| {
            if job.status != JobStatus::Running {
                return Ok(());
            }
            Self::set_overall(job, JobStatus::Failed)?;
            job.error_message = Some(error.to_string());
            job.last_run_finished_at = Some(Utc::now());
            Ok(())
        })?
    }

    async fn finalize(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        new_checkpoint: DateTime<Utc>,
        outcome: JobOutcome,
    ) -> Result<bool, SyncError> {
        self.with_job(job_id, tenant_id, |job| {
            if job.status != JobStatus::Running {
                return Ok(false);
            }
            Self::set_overall(job, outcome.as_status())?;
            job.checkpoint = None;
            job.last_run_finished_at = Some(Utc::now());
            job.error_message = None;
            if matches!(outcome, JobOutcome::Finished) {
                job.last_sync_date = Some(new_checkpoint);
                job.retry_count = 0;
            }
            Ok(true)
        })?
    }

    async fn update_stage_status(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        stage: StageType,
        state: StepState,
    ) -> Result<JobStatusDoc, SyncError> {
        self.with_job(job_id, tenant_id, |job| {
            let mut doc = job.status_document()?;
            doc.overall = job.status;
            doc.set_step(stage.as_str(), state);
            job.status_doc = doc.to_value()?;
            Ok(doc)
        })?
    }

    async fn tenant_tier(&self, tenant_id: Uuid) -> Result<ServiceTier, SyncError> {
        Ok(self
            .tiers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tenant_id)
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::pipeline::message::EntityKind;

    fn store_with_job() -> (InMemoryJobStore, SyncJob) {
        let store = InMemoryJobStore::new();
        let job = SyncJob::builder()
            .tenant_id(Uuid::new_v4())
            .job_name("tracker sync")
            .build();
        store.insert_job(job.clone());
        (store, job)
    }

    #[tokio::test]
    async fn only_one_caller_claims_running() {
        let (store, job) = store_with_job();
        let now = Utc::now();

        let first = store
            .try_mark_running(job.job_id, job.tenant_id, now)
            .await
            .unwrap();
        let second = store
            .try_mark_running(job.job_id, job.tenant_id, now)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(
            store.get(job.job_id, job.tenant_id).unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn inactive_job_cannot_be_claimed() {
        let store = InMemoryJobStore::new();
        let mut job = SyncJob::builder()
            .tenant_id(Uuid::new_v4())
            .job_name("disabled")
            .build();
        job.active = false;
        store.insert_job(job.clone());

        assert!(!store
            .try_mark_running(job.job_id, job.tenant_id, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn finalize_is_idempotent_under_duplicate_sentinels() {
        let (store, job) = store_with_job();
        let checkpoint = Utc::now();
        store
            .try_mark_running(job.job_id, job.tenant_id, Utc::now())
            .await
            .unwrap();

        let first = store
            .finalize(job.job_id, job.tenant_id, checkpoint, JobOutcome::Finished)
            .await
            .unwrap();
        let second = store
            .finalize(job.job_id, job.tenant_id, checkpoint, JobOutcome::Finished)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn finished_outcome_advances_last_sync_date() {
        let (store, job) = store_with_job();
        let run_start = Utc::now();
        store
            .try_mark_running(job.job_id, job.tenant_id, run_start)
            .await
            .unwrap();
        store
            .finalize(job.job_id, job.tenant_id, run_start, JobOutcome::Finished)
            .await
            .unwrap();

        let stored = store.get(job.job_id, job.tenant_id).unwrap();
        assert_eq!(stored.status, JobStatus::Finished);
        assert_eq!(stored.last_sync_date, Some(run_start));
        assert!(stored.checkpoint.is_none());
        assert!(stored.last_run_finished_at.is_some());
    }

    #[tokio::test]
    async fn rate_limited_outcome_keeps_last_sync_date() {
        let (store, mut job) = store_with_job();
        let previous_mark = Utc::now() - chrono::Duration::days(1);
        job.last_sync_date = Some(previous_mark);
        store.insert_job(job.clone());

        store
            .try_mark_running(job.job_id, job.tenant_id, Utc::now())
            .await
            .unwrap();
        store
            .finalize(
                job.job_id,
                job.tenant_id,
                Utc::now(),
                JobOutcome::RateLimited,
            )
            .await
            .unwrap();

        let stored = store.get(job.job_id, job.tenant_id).unwrap();
        assert_eq!(stored.status, JobStatus::RateLimited);
        assert_eq!(stored.last_sync_date, Some(previous_mark));
    }

    #[tokio::test]
    async fn park_for_retry_keeps_checkpoint_and_counts() {
        let (store, job) = store_with_job();
        store
            .try_mark_running(job.job_id, job.tenant_id, Utc::now())
            .await
            .unwrap();

        let mut cp = RecoveryCheckpoint::new(Utc::now());
        cp.push_unit("ISSUE-1", EntityKind::Issue);
        store
            .save_checkpoint(job.job_id, job.tenant_id, &cp)
            .await
            .unwrap();
        store
            .park_for_retry(job.job_id, job.tenant_id, "upstream timeout")
            .await
            .unwrap();

        let stored = store.get(job.job_id, job.tenant_id).unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.checkpoint.is_some());
        assert_eq!(stored.error_message.as_deref(), Some("upstream timeout"));
    }

    #[tokio::test]
    async fn mark_unit_finished_is_idempotent() {
        let (store, job) = store_with_job();
        let mut cp = RecoveryCheckpoint::new(Utc::now());
        cp.push_unit("a", EntityKind::Issue);
        cp.push_unit("b", EntityKind::Issue);
        store
            .save_checkpoint(job.job_id, job.tenant_id, &cp)
            .await
            .unwrap();

        store
            .mark_unit_finished(job.job_id, job.tenant_id, "a")
            .await
            .unwrap();
        store
            .mark_unit_finished(job.job_id, job.tenant_id, "a")
            .await
            .unwrap();

        let stored = store
            .get(job.job_id, job.tenant_id)
            .unwrap()
            .recovery_checkpoint()
            .unwrap()
            .unwrap();
        assert_eq!(stored.unfinished().len(), 1);
        assert_eq!(stored.unfinished()[0].unit_id, "b");
    }

    #[tokio::test]
    async fn stage_status_updates_accumulate_in_doc() {
        let (store, job) = store_with_job();
        store
            .try_mark_running(job.job_id, job.tenant_id, Utc::now())
            .await
            .unwrap();

        store
            .update_stage_status(
                job.job_id,
                job.tenant_id,
                StageType::Extraction,
                StepState::Finished,
            )
            .await
            .unwrap();
        let doc = store
            .update_stage_status(
                job.job_id,
                job.tenant_id,
                StageType::Transform,
                StepState::Running,
            )
            .await
            .unwrap();

        assert_eq!(doc.overall, JobStatus::Running);
        assert_eq!(doc.step("extraction"), Some(StepState::Finished));
        assert_eq!(doc.step("transform"), Some(StepState::Running));
    }

    #[tokio::test]
    async fn unknown_tenant_defaults_to_free_tier() {
        let store = InMemoryJobStore::new();
        assert_eq!(
            store.tenant_tier(Uuid::new_v4()).await.unwrap(),
            ServiceTier::Free
        );

        let tenant = Uuid::new_v4();
        store.set_tenant_tier(tenant, ServiceTier::Enterprise);
        assert_eq!(
            store.tenant_tier(tenant).await.unwrap(),
            ServiceTier::Enterprise
        );
    }
}
