//! Sync job model for scheduled ingestion runs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::errors::SyncError;
use crate::common::status::{JobStatus, JobStatusDoc};
use crate::kernel::jobs::checkpoint::RecoveryCheckpoint;

// ============================================================================
// Enums
// ============================================================================

/// The kind of external system a job ingests from. Stage sequencing is
/// fixed per source type, not user-configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "source_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    IssueTracker,
    CodeHost,
}

/// A tenant's service class, used to route work to an isolated queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "service_tier", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    #[default]
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl ServiceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTier::Free => "free",
            ServiceTier::Basic => "basic",
            ServiceTier::Premium => "premium",
            ServiceTier::Enterprise => "enterprise",
        }
    }

    pub const ALL: [ServiceTier; 4] = [
        ServiceTier::Free,
        ServiceTier::Basic,
        ServiceTier::Premium,
        ServiceTier::Enterprise,
    ];
}

/// Terminal outcome of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Run completed; the high-water-mark checkpoint advances.
    Finished,
    /// Run was throttled; the checkpoint is NOT advanced so the next
    /// scheduled run retries the same incremental window.
    RateLimited,
}

impl JobOutcome {
    pub fn as_status(&self) -> JobStatus {
        match self {
            JobOutcome::Finished => JobStatus::Finished,
            JobOutcome::RateLimited => JobStatus::RateLimited,
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// A persisted sync job. Identity is `(job_id, tenant_id)`.
///
/// Status transitions are driven only by the timer (to RUNNING) and by
/// stage workers (to FINISHED / FAILED / RATE_LIMITED / PENDING with a
/// checkpoint). Every transition goes through a conditional update on the
/// job row, which is the single serialization point for a job.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SyncJob {
    #[builder(default = Uuid::new_v4())]
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    #[builder(default = Uuid::new_v4())]
    pub integration_id: Uuid,

    pub job_name: String,
    #[builder(default)]
    pub source_type: SourceType,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = true)]
    pub active: bool,

    // Scheduling
    #[builder(default = 60)]
    pub schedule_interval_minutes: i64,
    #[builder(default, setter(strip_option))]
    pub next_run: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run_started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run_finished_at: Option<DateTime<Utc>>,

    /// High-water mark for incremental windows. Advanced only on a
    /// FINISHED outcome, to the timestamp captured at run start.
    #[builder(default, setter(strip_option))]
    pub last_sync_date: Option<DateTime<Utc>>,

    // Error tracking
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default = 0)]
    pub retry_count: i32,

    /// Structured status document `{overall, steps}`.
    #[builder(default = serde_json::Value::Null)]
    pub status_doc: serde_json::Value,

    /// Recovery checkpoint document; NULL when no run is in flight.
    #[builder(default, setter(strip_option))]
    pub checkpoint: Option<serde_json::Value>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// The configured schedule interval.
    pub fn schedule_interval(&self) -> Duration {
        Duration::minutes(self.schedule_interval_minutes.max(1))
    }

    /// Parse the persisted recovery checkpoint, if any.
    pub fn recovery_checkpoint(&self) -> Result<Option<RecoveryCheckpoint>, SyncError> {
        match &self.checkpoint {
            None => Ok(None),
            Some(value) if value.is_null() => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Parse the persisted status document, tolerating an empty column.
    pub fn status_document(&self) -> Result<JobStatusDoc, SyncError> {
        JobStatusDoc::from_value(&self.status_doc)
    }

    /// Whether the job is due to run at `now` according to its schedule.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.active || self.status == JobStatus::Paused {
            return false;
        }
        match self.next_run {
            None => true,
            Some(at) => at <= now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::checkpoint::RecoveryCheckpoint;
    use crate::kernel::pipeline::message::EntityKind;

    fn sample_job() -> SyncJob {
        SyncJob::builder()
            .tenant_id(Uuid::new_v4())
            .job_name("acme tracker sync")
            .build()
    }

    #[test]
    fn new_job_starts_pending_and_active() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.active);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn default_interval_is_one_hour() {
        let job = sample_job();
        assert_eq!(job.schedule_interval(), Duration::minutes(60));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let mut job = sample_job();
        job.schedule_interval_minutes = 0;
        assert_eq!(job.schedule_interval(), Duration::minutes(1));
    }

    #[test]
    fn job_without_next_run_is_due() {
        let job = sample_job();
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn inactive_job_is_never_due() {
        let mut job = sample_job();
        job.active = false;
        assert!(!job.is_due(Utc::now()));
    }

    #[test]
    fn paused_job_is_never_due() {
        let mut job = sample_job();
        job.status = JobStatus::Paused;
        assert!(!job.is_due(Utc::now()));
    }

    #[test]
    fn checkpoint_roundtrips_through_job_row() {
        let mut cp = RecoveryCheckpoint::new(Utc::now());
        cp.push_unit("ISSUE-1", EntityKind::Issue);
        cp.set_cursor("issues", "page-2");

        let mut job = sample_job();
        job.checkpoint = Some(serde_json::to_value(&cp).unwrap());

        let parsed = job.recovery_checkpoint().unwrap().unwrap();
        assert_eq!(parsed.queue.len(), 1);
        assert_eq!(parsed.cursor("issues"), Some("page-2"));
    }

    #[test]
    fn missing_checkpoint_parses_to_none() {
        let job = sample_job();
        assert!(job.recovery_checkpoint().unwrap().is_none());
    }

    #[test]
    fn rate_limited_outcome_maps_to_rate_limited_status() {
        assert_eq!(JobOutcome::RateLimited.as_status(), JobStatus::RateLimited);
        assert_eq!(JobOutcome::Finished.as_status(), JobStatus::Finished);
    }
}
