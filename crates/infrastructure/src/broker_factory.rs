use std::sync::Arc;
use tracing::{debug, info};

use taskfleet_core::config::{BrokerBackend, BrokerConfig};
use taskfleet_core::traits::{LockBackend, TaskQueue, TaskRunRepository, WorkerRegistry};
use taskfleet_core::SchedulerResult;

use crate::in_memory_queue::InMemoryStreamQueue;
use crate::lock::{InMemoryLockBackend, RedisLockBackend};
use crate::redis_repository::RedisTaskRunRepository;
use crate::redis_stream::{RedisConnectionManager, RedisStreamQueue};
use crate::registry::{InMemoryWorkerRegistry, RedisWorkerRegistry};
use crate::repository::InMemoryTaskRunRepository;

/// 共享broker上的服务
///
/// 同一进程内的各组件必须共用同一组实例，内存后端才能互相看见。
/// 运行实例也放在broker上，Leader切换后新Leader接着处理旧Leader的实例。
#[derive(Clone)]
pub struct BrokerHandles {
    pub queue: Arc<dyn TaskQueue>,
    pub lock: Arc<dyn LockBackend>,
    pub registry: Arc<dyn WorkerRegistry>,
    pub runs: Arc<dyn TaskRunRepository>,
}

pub struct BrokerFactory;

impl BrokerFactory {
    pub async fn create(config: &BrokerConfig) -> SchedulerResult<BrokerHandles> {
        debug!("创建broker后端: {:?}", config.backend);
        match config.backend {
            BrokerBackend::Memory => {
                info!("使用进程内broker（仅适用于单进程部署）");
                Ok(Self::in_memory())
            }
            BrokerBackend::Redis => {
                info!(
                    "使用Redis broker {}:{}",
                    config.redis.host, config.redis.port
                );
                let connection_manager = Arc::new(RedisConnectionManager::new(config).await?);
                Ok(BrokerHandles {
                    queue: Arc::new(RedisStreamQueue::new(connection_manager.clone())),
                    lock: Arc::new(RedisLockBackend::new(connection_manager.clone())),
                    registry: Arc::new(RedisWorkerRegistry::new(connection_manager.clone())),
                    runs: Arc::new(RedisTaskRunRepository::new(connection_manager)),
                })
            }
        }
    }

    pub fn in_memory() -> BrokerHandles {
        BrokerHandles {
            queue: Arc::new(InMemoryStreamQueue::new()),
            lock: Arc::new(InMemoryLockBackend::new()),
            registry: Arc::new(InMemoryWorkerRegistry::new()),
            runs: Arc::new(InMemoryTaskRunRepository::new()),
        }
    }
}
