pub mod broker_factory;
pub mod in_memory_queue;
pub mod lock;
pub mod redis_repository;
pub mod redis_stream;
pub mod registry;
pub mod repository;

pub use broker_factory::{BrokerFactory, BrokerHandles};
pub use in_memory_queue::InMemoryStreamQueue;
pub use lock::{InMemoryLockBackend, RedisLockBackend};
pub use redis_repository::RedisTaskRunRepository;
pub use redis_stream::{RedisConnectionManager, RedisStreamQueue};
pub use registry::{InMemoryWorkerRegistry, RedisWorkerRegistry};
pub use repository::{InMemoryTaskRepository, InMemoryTaskRunRepository};
