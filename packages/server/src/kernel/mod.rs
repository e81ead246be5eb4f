pub mod jobs;
pub mod pipeline;
pub mod status_hub;
pub mod sync_kernel;
pub mod ws;

pub use status_hub::StatusHub;
pub use sync_kernel::{PipelineLauncher, SyncKernel};
