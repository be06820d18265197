//! 结果消费
//!
//! Leader通过 `dispatchers` 消费组读取 `results` 分区，按 `run_id` 把每条
//! 消息交给状态机。重复、过期或被拒绝的消息同样会被确认，只有失去领导权
//! 或传输错误时才保留在待确认列表中，交给下一任Leader认领。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use taskfleet_core::models::{LogChunk, QueueEntry, ResultMessage};
use taskfleet_core::partitions::{DISPATCHERS_GROUP, LOGS, RESULTS};
use taskfleet_core::traits::{FencingToken, TaskQueue, TaskRunRepository};
use taskfleet_core::{ApplyOutcome, SchedulerError, SchedulerResult};

use crate::leader::LeadershipHandle;

/// 上一任Leader遗留的待确认结果在空闲这么久之后被认领
const ORPHAN_MIN_IDLE: Duration = Duration::from_secs(30);
/// 每隔多少批检查一次遗留结果
const RECLAIM_EVERY_BATCHES: u64 = 30;

pub struct ResultConsumer {
    run_repo: Arc<dyn TaskRunRepository>,
    queue: Arc<dyn TaskQueue>,
    leadership: LeadershipHandle,
    consumer: String,
    batch_size: usize,
    block: Duration,
}

impl ResultConsumer {
    pub fn new(
        run_repo: Arc<dyn TaskRunRepository>,
        queue: Arc<dyn TaskQueue>,
        leadership: LeadershipHandle,
        consumer: impl Into<String>,
        batch_size: usize,
        block: Duration,
    ) -> Self {
        Self {
            run_repo,
            queue,
            leadership,
            consumer: consumer.into(),
            batch_size,
            block,
        }
    }

    /// 读取并处理一批新结果，返回确认的条目数
    pub async fn process_batch(&self) -> SchedulerResult<usize> {
        self.leadership.check().await?;
        let entries = self
            .queue
            .consume(RESULTS, DISPATCHERS_GROUP, &self.consumer, self.batch_size, Some(self.block))
            .await?;
        self.handle_entries(entries).await
    }

    /// 认领空闲过久的结果（通常来自已经下台的Leader）
    pub async fn reclaim_orphaned(&self) -> SchedulerResult<usize> {
        self.leadership.check().await?;
        let entries = self
            .queue
            .reclaim(RESULTS, DISPATCHERS_GROUP, &self.consumer, ORPHAN_MIN_IDLE, self.batch_size)
            .await?;
        if !entries.is_empty() {
            info!("认领了 {} 条遗留的结果消息", entries.len());
        }
        self.handle_entries(entries).await
    }

    async fn handle_entries(&self, entries: Vec<QueueEntry>) -> SchedulerResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut acked = Vec::with_capacity(entries.len());
        let mut interrupted = None;
        for entry in &entries {
            let fence = match self.leadership.check().await {
                Ok(fence) => fence,
                Err(e) => {
                    interrupted = Some(e);
                    break;
                }
            };
            match self.handle_entry(entry, fence).await {
                Ok(()) => acked.push(entry.entry_id.clone()),
                Err(e) => {
                    interrupted = Some(e);
                    break;
                }
            }
        }

        // 已经处理完的部分照常确认
        let count = if acked.is_empty() {
            0
        } else {
            self.queue.ack(RESULTS, DISPATCHERS_GROUP, &acked).await?
        };
        match interrupted {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// 返回 `Ok` 表示条目可以确认
    async fn handle_entry(&self, entry: &QueueEntry, fence: FencingToken) -> SchedulerResult<()> {
        let update: ResultMessage = match entry.decode() {
            Ok(update) => update,
            Err(e) => {
                warn!("丢弃无法解析的结果消息 {}: {}", entry.entry_id, e);
                return Ok(());
            }
        };

        match self.run_repo.apply_update(&update, Some(fence)).await {
            Ok(outcome) => {
                metrics::counter!("taskfleet_status_updates_total", "outcome" => outcome.label()).increment(1);
                match outcome {
                    ApplyOutcome::Applied => {
                        debug!("执行实例 {} 状态更新为 {}", update.run_id, update.status)
                    }
                    ApplyOutcome::Duplicate | ApplyOutcome::Stale => debug!(
                        "忽略执行实例 {} 的{}状态更新 {}",
                        update.run_id,
                        outcome.label(),
                        update.status
                    ),
                    ApplyOutcome::Rejected(reason) => warn!(
                        "拒绝执行实例 {} 的状态更新 {}: {}",
                        update.run_id, update.status, reason
                    ),
                }
                Ok(())
            }
            Err(SchedulerError::TaskRunNotFound { execution_id }) => {
                warn!("结果消息引用了不存在的执行实例 {}，丢弃", execution_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 读取Worker上报的日志并输出到本地日志
    pub async fn drain_logs(&self) -> SchedulerResult<usize> {
        let entries = self
            .queue
            .consume(LOGS, DISPATCHERS_GROUP, &self.consumer, self.batch_size, None)
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let mut ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            match entry.decode::<LogChunk>() {
                Ok(chunk) => {
                    for line in &chunk.lines {
                        debug!(
                            target: "taskfleet::task_output",
                            worker_id = %chunk.worker_id,
                            execution_id = %line.execution_id,
                            stream = ?line.stream,
                            "{}",
                            line.line
                        );
                    }
                }
                Err(e) => warn!("丢弃无法解析的日志消息 {}: {}", entry.entry_id, e),
            }
            ids.push(entry.entry_id.clone());
        }
        self.queue.ack(LOGS, DISPATCHERS_GROUP, &ids).await
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut batches: u64 = 0;
        loop {
            let work = async {
                if !self.leadership.is_leader().await {
                    tokio::time::sleep(self.block).await;
                    return;
                }
                batches += 1;
                if batches % RECLAIM_EVERY_BATCHES == 1 {
                    if let Err(e) = self.reclaim_orphaned().await {
                        warn!("认领遗留结果失败: {}", e);
                    }
                }
                if let Err(e) = self.process_batch().await {
                    warn!("处理结果消息失败: {}", e);
                    tokio::time::sleep(self.block).await;
                }
                if let Err(e) = self.drain_logs().await {
                    warn!("读取日志消息失败: {}", e);
                }
            };
            tokio::select! {
                _ = work => {}
                _ = shutdown_rx.recv() => {
                    info!("结果消费循环已停止");
                    break;
                }
            }
        }
    }
}
