// Taskdispatch - background task dispatch with a synchronous degraded mode

pub mod config;
pub mod queue;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use queue::{Category, JobOptions, Submission, TaskQueues};
pub use types::{QueueError, QueueResult};
