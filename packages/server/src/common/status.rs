//! Job status document shared between the job store and the status hub.
//!
//! The document is persisted on the job row as JSON and replayed to new
//! observers, so it is a typed structure validated at the boundary rather
//! than a free-form JSON blob.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::SyncError;

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Finished,
    Failed,
    RateLimited,
    Paused,
}

/// Per-stage status inside the job status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Finished,
    Failed,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepStatus {
    pub status: StepState,
}

/// Structured status document: overall outcome plus one entry per stage.
///
/// Unknown stage names deserialize fine (they are just map keys), which
/// keeps the document forward compatible without losing type safety.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobStatusDoc {
    pub overall: JobStatus,
    #[serde(default)]
    pub steps: BTreeMap<String, StepStatus>,
}

impl JobStatusDoc {
    pub fn new(overall: JobStatus) -> Self {
        Self {
            overall,
            steps: BTreeMap::new(),
        }
    }

    /// Set the state for a stage, creating the entry if needed.
    pub fn set_step(&mut self, stage: &str, status: StepState) {
        self.steps.insert(stage.to_string(), StepStatus { status });
    }

    pub fn step(&self, stage: &str) -> Option<StepState> {
        self.steps.get(stage).map(|s| s.status)
    }

    /// Parse a persisted document, tolerating an empty column.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, SyncError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The frame pushed to observer channels on every status change.
pub fn status_update_frame(doc: &JobStatusDoc, timestamp: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "type": "status_update",
        "status": doc,
        "timestamp": timestamp,
    })
}
