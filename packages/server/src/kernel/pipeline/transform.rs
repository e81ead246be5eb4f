//! Transform stage: normalize a raw source payload into the entity shape
//! the embedding stage and downstream consumers read.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::common::errors::SyncError;
use crate::kernel::pipeline::message::{StageMessage, StageType};
use crate::kernel::pipeline::unit_store::{NormalizedEntity, RawUnit};
use crate::kernel::pipeline::worker::{StageHandler, StageOutcome};
use crate::kernel::sync_kernel::SyncKernel;

pub struct TransformHandler {
    kernel: SyncKernel,
}

impl TransformHandler {
    pub fn new(kernel: SyncKernel) -> Self {
        Self { kernel }
    }
}

/// Map a raw tracker payload onto the normalized entity shape. Sources
/// disagree on field names, so the common aliases are tried in order.
pub fn normalize(raw: &RawUnit) -> NormalizedEntity {
    let title = first_string(&raw.payload, &["title", "summary", "name"]).unwrap_or_default();
    let body = first_string(&raw.payload, &["description", "body"]).unwrap_or_default();

    let mut metadata = serde_json::Map::new();
    for key in ["state", "status", "labels", "assignee", "author", "url"] {
        if let Some(value) = raw.payload.get(key) {
            metadata.insert(key.to_string(), value.clone());
        }
    }

    NormalizedEntity {
        id: Uuid::new_v4(),
        tenant_id: raw.tenant_id,
        entity_kind: raw.entity_kind,
        external_id: raw.external_id.clone(),
        title,
        body,
        metadata: Value::Object(metadata),
        updated_at: Utc::now(),
    }
}

fn first_string(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(k).and_then(Value::as_str))
        .map(str::to_owned)
}

#[async_trait]
impl StageHandler for TransformHandler {
    fn stage(&self) -> StageType {
        StageType::Transform
    }

    async fn process(&self, message: &StageMessage) -> Result<StageOutcome, SyncError> {
        let reference = message
            .unit_reference
            .as_deref()
            .ok_or_else(|| SyncError::FatalConfig("transform message without unit".into()))?;
        let raw_id: Uuid = reference
            .parse()
            .map_err(|_| SyncError::FatalConfig(format!("malformed unit reference {reference}")))?;

        let raw = self
            .kernel
            .units
            .raw(raw_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("raw unit {raw_id}")))?;

        let entity = normalize(&raw);
        let entity_id = self.kernel.units.store_entity(&entity).await?;
        Ok(StageOutcome::Forward(entity_id.to_string()))
    }
}
