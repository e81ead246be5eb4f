//! Tier routing: maps a tenant's service tier to the per-stage queue its
//! work travels on. Tiers get fully isolated queues so a large free-tier
//! backlog cannot delay premium tenants.

use std::sync::Arc;

use uuid::Uuid;

use crate::common::errors::SyncError;
use crate::kernel::jobs::job::ServiceTier;
use crate::kernel::jobs::store::JobStore;
use crate::kernel::pipeline::message::StageType;

/// Queue name for one (stage, tier) pair: `{stage}_queue_{tier}`.
pub fn queue_name(stage: StageType, tier: ServiceTier) -> String {
    format!("{}_queue_{}", stage.as_str(), tier.as_str())
}

pub struct TierRouter {
    store: Arc<dyn JobStore>,
}

impl TierRouter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Resolve the queue a tenant's messages go to for a stage. Unknown
    /// tenants route to the free tier.
    pub async fn queue_for(&self, tenant_id: Uuid, stage: StageType) -> Result<String, SyncError> {
        let tier = self.store.tenant_tier(tenant_id).await?;
        Ok(queue_name(stage, tier))
    }
}
