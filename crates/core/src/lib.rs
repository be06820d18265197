pub mod backoff;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod partitions;
pub mod signing;
pub mod status_machine;
pub mod traits;

pub use backoff::{retry_with_backoff, Backoff};
pub use config::AppConfig;
pub use errors::{SchedulerError, SchedulerResult};
pub use status_machine::{apply_update, ApplyOutcome};
pub use traits::{FencingToken, LockBackend, TaskQueue, TaskRepository, TaskRunRepository, WorkerRegistry};
