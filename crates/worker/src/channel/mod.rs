//! Worker与控制面之间的通道
//!
//! 直连模式直接读写broker；代理模式经由网关的HTTP接口转发。
//! 两种模式对Worker服务暴露相同的操作，分区名在这里推导。

mod direct;
mod gateway;

pub use direct::DirectChannel;
pub use gateway::GatewayChannel;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use taskfleet_core::config::WorkerConfig;
use taskfleet_core::models::{HeartbeatMessage, LogChunk, QueueEntry, ResultMessage, RuntimeReply, TransportMode};
use taskfleet_core::{SchedulerError, SchedulerResult};
use taskfleet_infrastructure::BrokerHandles;

#[async_trait]
pub trait WorkerChannel: Send + Sync {
    async fn heartbeat(&self, heartbeat: &HeartbeatMessage, ttl: Duration) -> SchedulerResult<()>;

    /// 读取本Worker任务分区上的新条目
    async fn poll_tasks(&self, count: usize, block: Option<Duration>) -> SchedulerResult<Vec<QueueEntry>>;

    async fn ack_tasks(&self, entry_ids: &[String]) -> SchedulerResult<usize>;

    /// 认领本Worker任务分区上空闲过久的条目（包括上一个进程实例遗留的）
    async fn reclaim_tasks(&self, min_idle: Duration, count: usize) -> SchedulerResult<Vec<QueueEntry>>;

    async fn renew_tasks(&self, entry_ids: &[String]) -> SchedulerResult<usize>;

    async fn publish_result(&self, result: &ResultMessage) -> SchedulerResult<()>;

    async fn publish_logs(&self, chunk: &LogChunk) -> SchedulerResult<()>;

    /// 同时读取专属控制分区和全局控制分区
    async fn poll_control(&self, count: usize, block: Option<Duration>) -> SchedulerResult<Vec<QueueEntry>>;

    async fn ack_control(&self, partition: &str, entry_ids: &[String]) -> SchedulerResult<usize>;

    /// 认领两个控制分区上空闲过久、未被确认的控制消息
    async fn reclaim_control(&self, min_idle: Duration, count: usize) -> SchedulerResult<Vec<QueueEntry>>;

    async fn reply(&self, reply_stream: &str, reply: &RuntimeReply) -> SchedulerResult<()>;
}

/// 按配置创建通道；直连模式需要broker句柄
pub fn channel_for(
    config: &WorkerConfig,
    worker_id: &str,
    boot_id: &str,
    broker: Option<&BrokerHandles>,
) -> SchedulerResult<Arc<dyn WorkerChannel>> {
    match config.transport {
        TransportMode::Direct => {
            let broker = broker.ok_or_else(|| SchedulerError::Configuration("直连模式需要broker配置".to_string()))?;
            Ok(Arc::new(DirectChannel::new(
                broker.queue.clone(),
                broker.registry.clone(),
                worker_id,
                boot_id,
            )))
        }
        TransportMode::Proxied => {
            let url = config
                .gateway_url
                .clone()
                .ok_or_else(|| SchedulerError::Configuration("代理模式需要gateway_url".to_string()))?;
            Ok(Arc::new(GatewayChannel::new(url, worker_id, boot_id, config.auth.clone())?))
        }
    }
}
