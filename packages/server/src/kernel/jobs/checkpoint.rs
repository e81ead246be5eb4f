//! Recovery checkpoint: the durable state that lets an interrupted run
//! resume without redoing finished work.
//!
//! The checkpoint holds an ordered queue of work units with per-unit
//! completion flags, plus one opaque pagination cursor per resource the
//! extraction stage traverses. It is persisted on the job row before
//! fan-out begins and updated as units complete; once every unit is
//! finished the checkpoint is cleared by finalization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::pipeline::message::EntityKind;

/// One unit of work discovered during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// External identifier of the unit in the source system.
    pub unit_id: String,
    pub entity_kind: EntityKind,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    /// Opaque pagination cursors, one per paginated resource.
    #[serde(default)]
    pub cursors: BTreeMap<String, String>,
    /// Ordered processing queue with per-unit completion flags.
    #[serde(default)]
    pub queue: Vec<WorkUnit>,
    /// Timestamp captured at the start of the run. Becomes the new
    /// `last_sync_date` when the run finishes, so updates arriving during
    /// the run are not missed on the next incremental pass.
    pub run_started_at: DateTime<Utc>,
}

impl RecoveryCheckpoint {
    pub fn new(run_started_at: DateTime<Utc>) -> Self {
        Self {
            cursors: BTreeMap::new(),
            queue: Vec::new(),
            run_started_at,
        }
    }

    /// Append a unit if it is not already queued. Duplicate enumeration
    /// (a resumed pagination page overlapping the saved queue) is a no-op.
    pub fn push_unit(&mut self, unit_id: impl Into<String>, entity_kind: EntityKind) -> bool {
        let unit_id = unit_id.into();
        if self.queue.iter().any(|u| u.unit_id == unit_id) {
            return false;
        }
        self.queue.push(WorkUnit {
            unit_id,
            entity_kind,
            finished: false,
        });
        true
    }

    /// Mark a unit finished. Idempotent: marking an already-finished unit
    /// (or an unknown one) changes nothing and returns false.
    pub fn mark_finished(&mut self, unit_id: &str) -> bool {
        match self.queue.iter_mut().find(|u| u.unit_id == unit_id) {
            Some(unit) if !unit.finished => {
                unit.finished = true;
                true
            }
            _ => false,
        }
    }

    /// The units still to be processed, in enumeration order.
    pub fn unfinished(&self) -> Vec<WorkUnit> {
        self.queue.iter().filter(|u| !u.finished).cloned().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.queue.iter().all(|u| u.finished)
    }

    pub fn set_cursor(&mut self, resource: &str, cursor: impl Into<String>) {
        self.cursors.insert(resource.to_string(), cursor.into());
    }

    pub fn clear_cursor(&mut self, resource: &str) {
        self.cursors.remove(resource);
    }

    pub fn cursor(&self, resource: &str) -> Option<&str> {
        self.cursors.get(resource).map(String::as_str)
    }

    /// True when nothing was ever enumerated into this checkpoint.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.cursors.is_empty()
    }
}
