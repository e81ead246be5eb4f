pub mod common;
pub mod config;
pub mod kernel;

pub use common::broker::{Broker, InMemoryBroker, NatsBroker};
pub use common::errors::SyncError;
pub use common::status::{JobStatus, JobStatusDoc, StepState};
pub use config::Config;
pub use kernel::jobs::{
    InMemoryJobStore, JobOutcome, JobStore, JobTimerManager, PostgresJobStore, RecoveryCheckpoint,
    ServiceTier, SourceType, SyncJob, TimerConfig,
};
pub use kernel::pipeline::{
    EntityKind, InMemoryUnitStore, PostgresUnitStore, StageMessage, StageType, StageWorker,
    StageWorkerConfig, UnitStore,
};
pub use kernel::{PipelineLauncher, StatusHub, SyncKernel};
