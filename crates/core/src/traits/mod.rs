pub mod lock;
pub mod queue;
pub mod registry;
pub mod repository;

pub use lock::{FencingToken, LockBackend};
pub use queue::{enqueue_message, TaskQueue};
pub use registry::WorkerRegistry;
pub use repository::{CreateOutcome, TaskRepository, TaskRunRepository};
