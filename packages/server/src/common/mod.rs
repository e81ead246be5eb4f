//! Cross-cutting types: error taxonomy, status documents, broker abstraction.

pub mod broker;
pub mod errors;
pub mod status;

pub use broker::{Broker, InMemoryBroker, NatsBroker};
pub use errors::SyncError;
pub use status::{status_update_frame, JobStatus, JobStatusDoc, StepState, StepStatus};
