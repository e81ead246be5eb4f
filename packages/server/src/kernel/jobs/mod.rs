pub mod checkpoint;
pub mod job;
pub mod store;
pub mod timer;
pub mod timer_manager;

pub use checkpoint::{RecoveryCheckpoint, WorkUnit};
pub use job::{JobOutcome, ServiceTier, SourceType, SyncJob};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore};
pub use timer::{JobLauncher, JobTimer, TimerConfig, TimerHandle};
pub use timer_manager::JobTimerManager;
