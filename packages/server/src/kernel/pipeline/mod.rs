pub mod embed;
pub mod extract;
pub mod message;
pub mod router;
pub mod transform;
pub mod unit_store;
pub mod worker;

pub use embed::{Embedder, EmbeddingHandler, VectorIndex};
pub use extract::{ExtractionHandler, SourceClient, SourceItem, SourcePage};
pub use message::{EntityKind, StageMessage, StageType};
pub use router::{queue_name, TierRouter};
pub use transform::TransformHandler;
pub use unit_store::{InMemoryUnitStore, NormalizedEntity, PostgresUnitStore, RawUnit, UnitStore};
pub use worker::{StageHandler, StageOutcome, StageWorker, StageWorkerConfig};
