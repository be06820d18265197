use async_trait::async_trait;
use std::time::Duration;

use crate::errors::SchedulerResult;
use crate::models::{HeartbeatMessage, WorkerNode};

/// Worker注册表
///
/// 心跳刷新一个带TTL的存活键；节点信息本身保留更久，供调度时读取。
/// `list_workers` 返回的状态来自最近一次心跳，可能已经过时，
/// 需要确定结果时使用 `probe`。
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn record_heartbeat(&self, heartbeat: &HeartbeatMessage, ttl: Duration) -> SchedulerResult<()>;

    async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<WorkerNode>>;

    async fn list_workers(&self) -> SchedulerResult<Vec<WorkerNode>>;

    /// 直接检查存活键
    async fn probe(&self, worker_id: &str) -> SchedulerResult<bool>;

    async fn remove_worker(&self, worker_id: &str) -> SchedulerResult<()>;
}
