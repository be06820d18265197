//! 基于Redis Streams的任务队列
//!
//! 分区对应一个stream key，消费组和待确认列表直接使用Redis的
//! XREADGROUP / XACK / XAUTOCLAIM 语义。

pub mod connection_manager;
pub mod metrics_collector;
pub mod stream_operations;

pub use connection_manager::RedisConnectionManager;
pub use metrics_collector::{MetricsSnapshot, RedisStreamMetrics};
pub use stream_operations::RedisStreamOperations;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use taskfleet_core::models::{PendingEntry, QueueEntry};
use taskfleet_core::traits::TaskQueue;
use taskfleet_core::{SchedulerError, SchedulerResult};

/// 阻塞读取时的轮询间隔
///
/// 多路复用连接上不能使用 `BLOCK`，否则会挡住同一连接上的其他命令。
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RedisStreamQueue {
    operations: RedisStreamOperations,
    metrics: Arc<RedisStreamMetrics>,
}

fn is_missing_group(e: &SchedulerError) -> bool {
    e.to_string().contains("NOGROUP")
}

impl RedisStreamQueue {
    pub fn new(connection_manager: Arc<RedisConnectionManager>) -> Self {
        let metrics = connection_manager.metrics();
        Self {
            operations: RedisStreamOperations::new(connection_manager),
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<RedisStreamMetrics> {
        self.metrics.clone()
    }

    async fn read_once(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        self.operations.ensure_consumer_group(partition, group).await?;
        match self.operations.xreadgroup(partition, group, consumer, count).await {
            Err(e) if is_missing_group(&e) => {
                self.operations.forget_group(partition, group).await;
                self.operations.ensure_consumer_group(partition, group).await?;
                self.operations.xreadgroup(partition, group, consumer, count).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl TaskQueue for RedisStreamQueue {
    async fn enqueue(&self, partition: &str, payload: &serde_json::Value) -> SchedulerResult<String> {
        let id = self.operations.xadd(partition, payload).await?;
        self.metrics.record_enqueued();
        Ok(id)
    }

    async fn consume(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let entries = self.read_once(partition, group, consumer, count).await?;
            if !entries.is_empty() {
                self.metrics.record_delivered(entries.len());
                return Ok(entries);
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(remaining.min(POLL_INTERVAL)).await;
                }
                _ => return Ok(vec![]),
            }
        }
    }

    async fn ack(&self, partition: &str, group: &str, entry_ids: &[String]) -> SchedulerResult<usize> {
        match self.operations.xack(partition, group, entry_ids).await {
            Ok(n) => {
                self.metrics.record_acked(n);
                Ok(n)
            }
            Err(e) if is_missing_group(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn reclaim(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        match self
            .operations
            .xautoclaim(partition, group, consumer, min_idle, count)
            .await
        {
            Ok(entries) => {
                self.metrics.record_reclaimed(entries.len());
                Ok(entries)
            }
            Err(e) if is_missing_group(&e) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    async fn renew(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        entry_ids: &[String],
    ) -> SchedulerResult<usize> {
        match self
            .operations
            .xclaim_renew(partition, group, consumer, entry_ids)
            .await
        {
            Err(e) if is_missing_group(&e) => Ok(0),
            other => other,
        }
    }

    async fn pending(&self, partition: &str, group: &str) -> SchedulerResult<Vec<PendingEntry>> {
        match self.operations.xpending(partition, group).await {
            Err(e) if is_missing_group(&e) => Ok(vec![]),
            other => other,
        }
    }

    async fn len(&self, partition: &str) -> SchedulerResult<usize> {
        self.operations.xlen(partition).await
    }

    async fn expire(&self, partition: &str, ttl: Duration) -> SchedulerResult<()> {
        self.operations.expire(partition, ttl).await
    }
}
