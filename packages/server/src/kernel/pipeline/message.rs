//! Stage message: the unit of work passed between pipeline stages.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::errors::SyncError;

/// One phase of the pipeline. The sequence is fixed:
/// extraction → transform → embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Extraction,
    Transform,
    Embedding,
}

impl StageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::Extraction => "extraction",
            StageType::Transform => "transform",
            StageType::Embedding => "embedding",
        }
    }

    /// The downstream stage, or `None` for the terminal stage.
    pub fn next(&self) -> Option<StageType> {
        match self {
            StageType::Extraction => Some(StageType::Transform),
            StageType::Transform => Some(StageType::Embedding),
            StageType::Embedding => None,
        }
    }

    /// Whether this stage has no upstream stage (it is kicked off by the
    /// timer rather than fed by another stage).
    pub fn is_initial(&self) -> bool {
        matches!(self, StageType::Extraction)
    }

    pub fn parse(s: &str) -> Option<StageType> {
        match s {
            "extraction" => Some(StageType::Extraction),
            "transform" => Some(StageType::Transform),
            "embedding" => Some(StageType::Embedding),
            _ => None,
        }
    }

    pub const ALL: [StageType; 3] = [
        StageType::Extraction,
        StageType::Transform,
        StageType::Embedding,
    ];
}

/// The kind of entity a work unit refers to. Stored as text in the unit
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Issue,
    MergeRequest,
    Repository,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Issue => "issue",
            EntityKind::MergeRequest => "merge_request",
            EntityKind::Repository => "repository",
        }
    }
}

/// Wire-format message moved between stages over the tier queues.
///
/// `unit_reference = None` marks a completion sentinel rather than a work
/// item. Ordering within a job run is reconstructed from the flags, not
/// from queue position: exactly one message per stage carries
/// `last_item = true`, and `last_job_item` is copied verbatim downstream
/// so exactly one message reaches the point of finalization with it set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMessage {
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub integration_id: Uuid,
    pub stage_type: StageType,
    pub entity_kind: EntityKind,
    /// Stored-payload id or external entity id; `None` for sentinels.
    pub unit_reference: Option<String>,
    /// The previous high-water mark (start of the incremental window).
    pub old_checkpoint: Option<DateTime<Utc>>,
    /// Timestamp captured at run start; becomes the new high-water mark
    /// when the run finishes.
    pub new_checkpoint: DateTime<Utc>,
    pub first_item: bool,
    /// Last item of this stage's emission.
    pub last_item: bool,
    /// Last item of the entire job; propagated unchanged downstream.
    pub last_job_item: bool,
    /// Carried by rate-limit sentinels so finalization picks the
    /// RATE_LIMITED outcome instead of FINISHED.
    pub rate_limited: bool,
}

impl StageMessage {
    pub fn is_sentinel(&self) -> bool {
        self.unit_reference.is_none()
    }

    /// Build the message for the downstream stage, carrying this unit's
    /// position flags and `last_job_item` verbatim.
    pub fn for_next_stage(&self, next: StageType, unit_reference: String) -> StageMessage {
        StageMessage {
            stage_type: next,
            unit_reference: Some(unit_reference),
            ..self.clone()
        }
    }

    /// Build a sentinel for the downstream stage, preserving flags.
    pub fn sentinel_for_next_stage(&self, next: StageType) -> StageMessage {
        StageMessage {
            stage_type: next,
            unit_reference: None,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Bytes, SyncError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<StageMessage, SyncError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
