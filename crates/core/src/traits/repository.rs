//! 持久化层接口
//!
//! 任务定义由外部系统维护，调度器只读；运行实例由Leader创建，
//! 状态只能经由状态机修改。所有由领导权派生的写入都带上当前的
//! fencing token，仓储记住见过的最大token并拒绝更小的token，
//! 被罢免的Leader迟到的写入因此不会生效。

use async_trait::async_trait;

use super::lock::FencingToken;
use crate::errors::SchedulerResult;
use crate::models::{ResultMessage, TaskDefinition, TaskRun};
use crate::status_machine::ApplyOutcome;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: i64) -> SchedulerResult<Option<TaskDefinition>>;

    async fn list_active_tasks(&self) -> SchedulerResult<Vec<TaskDefinition>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(TaskRun),
    /// 相同的 `execution_id` 已经存在，返回已有实例
    Existing(TaskRun),
}

impl CreateOutcome {
    pub fn run(&self) -> &TaskRun {
        match self {
            CreateOutcome::Created(run) | CreateOutcome::Existing(run) => run,
        }
    }

    pub fn into_run(self) -> TaskRun {
        match self {
            CreateOutcome::Created(run) | CreateOutcome::Existing(run) => run,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

#[async_trait]
pub trait TaskRunRepository: Send + Sync {
    async fn create_run(&self, run: &TaskRun, fence: Option<FencingToken>) -> SchedulerResult<CreateOutcome>;

    async fn get_run(&self, execution_id: &str) -> SchedulerResult<Option<TaskRun>>;

    /// 按状态机规则应用一条更新；实例不存在时返回 `TaskRunNotFound`
    async fn apply_update(
        &self,
        update: &ResultMessage,
        fence: Option<FencingToken>,
    ) -> SchedulerResult<ApplyOutcome>;

    /// 尚未结束的运行实例，`task_id` 为 `None` 时返回全部
    async fn list_unfinished(&self, task_id: Option<i64>) -> SchedulerResult<Vec<TaskRun>>;

    /// 已结束、未成功且尚未被重试过的实例
    async fn list_retry_candidates(&self) -> SchedulerResult<Vec<TaskRun>>;

    /// 记录 `execution_id` 已由 `retry_execution_id` 重试；已经标记过时返回 `false`
    async fn mark_retried(
        &self,
        execution_id: &str,
        retry_execution_id: &str,
        fence: Option<FencingToken>,
    ) -> SchedulerResult<bool>;
}
