//! Unit store: persistence for stage payloads.
//!
//! Stages pass references, not payloads: extraction stores the raw source
//! document and forwards its id; transform stores the normalized entity
//! and forwards that id; embedding records the vector bridge row linking
//! the entity to its point in the external index.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::errors::SyncError;
use crate::kernel::pipeline::message::EntityKind;

/// Raw source payload captured by the extraction stage.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RawUnit {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub entity_kind: EntityKind,
    pub external_id: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl RawUnit {
    pub fn new(
        tenant_id: Uuid,
        job_id: Uuid,
        entity_kind: EntityKind,
        external_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            job_id,
            entity_kind,
            external_id: external_id.into(),
            payload,
            fetched_at: Utc::now(),
        }
    }
}

/// Normalized entity produced by the transform stage.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEntity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_kind: EntityKind,
    pub external_id: String,
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait UnitStore: Send + Sync {
    async fn store_raw(&self, unit: &RawUnit) -> Result<(), SyncError>;
    async fn raw(&self, id: Uuid) -> Result<Option<RawUnit>, SyncError>;

    /// Upsert a normalized entity keyed by `(tenant, kind, external_id)`
    /// and return the canonical row id. Re-syncing an entity keeps the id
    /// of the existing row, not the freshly generated one.
    async fn store_entity(&self, entity: &NormalizedEntity) -> Result<Uuid, SyncError>;
    async fn entity(&self, id: Uuid) -> Result<Option<NormalizedEntity>, SyncError>;

    /// Record (or refresh) the bridge row linking an entity to its point
    /// in the external vector index, keeping a copy of the vector for
    /// local rebuilds.
    async fn upsert_bridge(
        &self,
        entity_id: Uuid,
        collection: &str,
        point_id: Uuid,
        vector: &[f32],
    ) -> Result<(), SyncError>;
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

pub struct PostgresUnitStore {
    pool: PgPool,
}

impl PostgresUnitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnitStore for PostgresUnitStore {
    async fn store_raw(&self, unit: &RawUnit) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO raw_units (id, tenant_id, job_id, entity_kind, external_id, payload, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET payload = EXCLUDED.payload, fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(unit.id)
        .bind(unit.tenant_id)
        .bind(unit.job_id)
        .bind(unit.entity_kind)
        .bind(&unit.external_id)
        .bind(&unit.payload)
        .bind(unit.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn raw(&self, id: Uuid) -> Result<Option<RawUnit>, SyncError> {
        let unit = sqlx::query_as::<_, RawUnit>(
            r#"
            SELECT id, tenant_id, job_id, entity_kind, external_id, payload, fetched_at
            FROM raw_units WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(unit)
    }

    async fn store_entity(&self, entity: &NormalizedEntity) -> Result<Uuid, SyncError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO normalized_entities
                (id, tenant_id, entity_kind, external_id, title, body, metadata, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, entity_kind, external_id) DO UPDATE
            SET title = EXCLUDED.title,
                body = EXCLUDED.body,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(entity.id)
        .bind(entity.tenant_id)
        .bind(entity.entity_kind)
        .bind(&entity.external_id)
        .bind(&entity.title)
        .bind(&entity.body)
        .bind(&entity.metadata)
        .bind(entity.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn entity(&self, id: Uuid) -> Result<Option<NormalizedEntity>, SyncError> {
        let entity = sqlx::query_as::<_, NormalizedEntity>(
            r#"
            SELECT id, tenant_id, entity_kind, external_id, title, body, metadata, updated_at
            FROM normalized_entities WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entity)
    }

    async fn upsert_bridge(
        &self,
        entity_id: Uuid,
        collection: &str,
        point_id: Uuid,
        vector: &[f32],
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO embedding_bridge (entity_id, collection, point_id, embedding, embedded_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (entity_id, collection) DO UPDATE
            SET point_id = EXCLUDED.point_id,
                embedding = EXCLUDED.embedding,
                embedded_at = NOW()
            "#,
        )
        .bind(entity_id)
        .bind(collection)
        .bind(point_id)
        .bind(pgvector::Vector::from(vector.to_vec()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation (tests and single-process runs)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRow {
    pub collection: String,
    pub point_id: Uuid,
    pub vector: Vec<f32>,
}

#[derive(Default)]
pub struct InMemoryUnitStore {
    raw: RwLock<HashMap<Uuid, RawUnit>>,
    entities: RwLock<HashMap<Uuid, NormalizedEntity>>,
    bridges: RwLock<HashMap<(Uuid, String), BridgeRow>>,
}

impl InMemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_count(&self) -> usize {
        self.raw.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn bridge(&self, entity_id: Uuid, collection: &str) -> Option<BridgeRow> {
        self.bridges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(entity_id, collection.to_string()))
            .cloned()
    }

    /// Drop an entity, simulating deletion between transform and embed.
    pub fn remove_entity(&self, id: Uuid) {
        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

#[async_trait]
impl UnitStore for InMemoryUnitStore {
    async fn store_raw(&self, unit: &RawUnit) -> Result<(), SyncError> {
        self.raw
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unit.id, unit.clone());
        Ok(())
    }

    async fn raw(&self, id: Uuid) -> Result<Option<RawUnit>, SyncError> {
        Ok(self
            .raw
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn store_entity(&self, entity: &NormalizedEntity) -> Result<Uuid, SyncError> {
        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        let existing = entities
            .values()
            .find(|e| {
                e.tenant_id == entity.tenant_id
                    && e.entity_kind == entity.entity_kind
                    && e.external_id == entity.external_id
            })
            .map(|e| e.id);

        let id = existing.unwrap_or(entity.id);
        let mut stored = entity.clone();
        stored.id = id;
        entities.insert(id, stored);
        Ok(id)
    }

    async fn entity(&self, id: Uuid) -> Result<Option<NormalizedEntity>, SyncError> {
        Ok(self
            .entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn upsert_bridge(
        &self,
        entity_id: Uuid,
        collection: &str,
        point_id: Uuid,
        vector: &[f32],
    ) -> Result<(), SyncError> {
        self.bridges
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (entity_id, collection.to_string()),
                BridgeRow {
                    collection: collection.to_string(),
                    point_id,
                    vector: vector.to_vec(),
                },
            );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_units_roundtrip() {
        let store = InMemoryUnitStore::new();
        let unit = RawUnit::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            EntityKind::Issue,
            "ISSUE-7",
            serde_json::json!({"title": "crash on save"}),
        );
        store.store_raw(&unit).await.unwrap();

        let loaded = store.raw(unit.id).await.unwrap().unwrap();
        assert_eq!(loaded.external_id, "ISSUE-7");
        assert!(store.raw(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bridge_upsert_replaces_prior_vector() {
        let store = InMemoryUnitStore::new();
        let entity_id = Uuid::new_v4();
        let point = Uuid::new_v4();

        store
            .upsert_bridge(entity_id, "tracker_entities", point, &[0.1, 0.2])
            .await
            .unwrap();
        store
            .upsert_bridge(entity_id, "tracker_entities", point, &[0.3, 0.4])
            .await
            .unwrap();

        let row = store.bridge(entity_id, "tracker_entities").unwrap();
        assert_eq!(row.vector, vec![0.3, 0.4]);
    }
}
