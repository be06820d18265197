//! 基于流的任务队列抽象
//!
//! 每个Worker拥有自己的逻辑分区，分区内通过消费组跟踪每个消费者
//! 尚未确认的条目。投递语义为至少一次：只有显式ack才会把条目从
//! 待确认列表中移除，持有者空闲超过阈值的条目会被reclaim给其他
//! 活跃消费者，并递增投递计数。

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::errors::SchedulerResult;
use crate::models::{PendingEntry, QueueEntry};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 追加一条消息，返回条目ID
    async fn enqueue(&self, partition: &str, payload: &serde_json::Value) -> SchedulerResult<String>;

    /// 读取从未投递过的条目，按入队顺序返回；消费组不存在时自动创建
    ///
    /// `block` 为 `Some` 时在没有新条目的情况下最多等待该时长。
    async fn consume(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> SchedulerResult<Vec<QueueEntry>>;

    /// 确认条目，返回实际确认的数量
    async fn ack(&self, partition: &str, group: &str, entry_ids: &[String]) -> SchedulerResult<usize>;

    /// 认领空闲时间不少于 `min_idle` 的待确认条目
    async fn reclaim(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SchedulerResult<Vec<QueueEntry>>;

    /// 重置仍由 `consumer` 持有的条目的空闲时间
    async fn renew(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        entry_ids: &[String],
    ) -> SchedulerResult<usize>;

    async fn pending(&self, partition: &str, group: &str) -> SchedulerResult<Vec<PendingEntry>>;

    /// 分区中尚未删除的条目数量
    async fn len(&self, partition: &str) -> SchedulerResult<usize>;

    /// 为整个分区设置过期时间，用于短生命周期的回复通道
    async fn expire(&self, partition: &str, ttl: Duration) -> SchedulerResult<()>;
}

/// 序列化后入队
pub async fn enqueue_message<T: Serialize + Sync>(
    queue: &dyn TaskQueue,
    partition: &str,
    message: &T,
) -> SchedulerResult<String> {
    let payload = serde_json::to_value(message)?;
    queue.enqueue(partition, &payload).await
}
