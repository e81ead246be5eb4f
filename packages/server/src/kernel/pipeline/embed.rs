//! Embedding stage: vectorize a normalized entity, push the vector to the
//! external index, and record the bridge row. Terminal stage of the
//! pipeline; the message carrying `last_job_item` finalizes the run.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::errors::SyncError;
use crate::kernel::pipeline::message::{StageMessage, StageType};
use crate::kernel::pipeline::worker::{StageHandler, StageOutcome};
use crate::kernel::sync_kernel::SyncKernel;

/// Turns text into a vector (external embedding service).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SyncError>;
}

/// Upserts points into the external vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        collection: &str,
        point_id: Uuid,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> Result<(), SyncError>;
}

pub struct EmbeddingHandler {
    kernel: SyncKernel,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    collection: String,
}

impl EmbeddingHandler {
    pub fn new(
        kernel: SyncKernel,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            kernel,
            embedder,
            index,
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl StageHandler for EmbeddingHandler {
    fn stage(&self) -> StageType {
        StageType::Embedding
    }

    async fn process(&self, message: &StageMessage) -> Result<StageOutcome, SyncError> {
        let reference = message
            .unit_reference
            .as_deref()
            .ok_or_else(|| SyncError::FatalConfig("embedding message without unit".into()))?;
        let entity_id: Uuid = reference
            .parse()
            .map_err(|_| SyncError::FatalConfig(format!("malformed unit reference {reference}")))?;

        let entity = self
            .kernel
            .units
            .entity(entity_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("entity {entity_id}")))?;

        let text = format!("{}\n\n{}", entity.title, entity.body);
        let vector = self.embedder.embed(&text).await?;

        // The entity id doubles as the point id, so re-embedding the same
        // entity overwrites its point instead of accumulating duplicates.
        let payload = serde_json::json!({
            "tenant_id": entity.tenant_id,
            "entity_kind": entity.entity_kind.as_str(),
            "external_id": entity.external_id,
            "title": entity.title,
        });
        self.index
            .upsert(&self.collection, entity.id, &vector, payload)
            .await?;
        self.kernel
            .units
            .upsert_bridge(entity.id, &self.collection, entity.id, &vector)
            .await?;

        Ok(StageOutcome::Done)
    }
}
