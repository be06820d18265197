//! 内存仓储
//!
//! 任务定义与运行实例的持久化由外部系统负责，这里的实现用于单进程部署
//! 和测试。运行实例仓储记住见过的最大fencing token。多个Dispatcher
//! 共享运行实例时使用 [`crate::redis_repository::RedisTaskRunRepository`]。

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use taskfleet_core::models::{ResultMessage, TaskDefinition, TaskRun};
use taskfleet_core::status_machine::apply_update;
use taskfleet_core::traits::{CreateOutcome, FencingToken, TaskRepository, TaskRunRepository};
use taskfleet_core::{ApplyOutcome, SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<i64, TaskDefinition>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从JSON文件加载任务定义（数组）
    pub async fn load_from_file(path: &Path) -> SchedulerResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SchedulerError::Configuration(format!("无法读取任务文件 {}: {e}", path.display()))
        })?;
        let tasks: Vec<TaskDefinition> = serde_json::from_str(&raw)?;
        let repo = Self::new();
        for task in tasks {
            repo.upsert(task).await;
        }
        info!(
            "从 {} 加载了 {} 个任务定义",
            path.display(),
            repo.tasks.read().await.len()
        );
        Ok(repo)
    }

    pub async fn upsert(&self, task: TaskDefinition) {
        self.tasks.write().await.insert(task.id, task);
    }

    pub async fn remove(&self, id: i64) -> Option<TaskDefinition> {
        self.tasks.write().await.remove(&id)
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get_task(&self, id: i64) -> SchedulerResult<Option<TaskDefinition>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_active_tasks(&self) -> SchedulerResult<Vec<TaskDefinition>> {
        let mut tasks: Vec<TaskDefinition> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}

/// 已结束、未成功且尚未被重试过
pub(crate) fn is_retry_candidate(run: &TaskRun) -> bool {
    run.is_finished() && !run.is_successful() && run.retried_by.is_none()
}

// 以下三个函数是运行实例的读改写步骤：输入当前值，返回需要写回的新值
// （`None` 表示不写）和调用方得到的结果。两种仓储共用。

pub(crate) fn plan_create(current: Option<TaskRun>, run: &TaskRun) -> (Option<TaskRun>, CreateOutcome) {
    match current {
        Some(existing) => {
            debug!("执行实例 {} 已存在", run.execution_id);
            (None, CreateOutcome::Existing(existing))
        }
        None => (Some(run.clone()), CreateOutcome::Created(run.clone())),
    }
}

pub(crate) fn plan_update(
    current: Option<TaskRun>,
    update: &ResultMessage,
) -> (Option<TaskRun>, SchedulerResult<ApplyOutcome>) {
    let Some(mut run) = current else {
        return (
            None,
            Err(SchedulerError::TaskRunNotFound {
                execution_id: update.run_id.clone(),
            }),
        );
    };
    let outcome = apply_update(&mut run, update);
    let next = outcome.is_applied().then_some(run);
    (next, Ok(outcome))
}

pub(crate) fn plan_mark_retried(
    current: Option<TaskRun>,
    execution_id: &str,
    retry_execution_id: &str,
) -> (Option<TaskRun>, SchedulerResult<bool>) {
    match current {
        None => (
            None,
            Err(SchedulerError::TaskRunNotFound {
                execution_id: execution_id.to_string(),
            }),
        ),
        Some(run) if run.retried_by.is_some() => (None, Ok(false)),
        Some(mut run) => {
            run.retried_by = Some(retry_execution_id.to_string());
            (Some(run), Ok(true))
        }
    }
}

#[derive(Debug, Default)]
struct RunStore {
    runs: HashMap<String, TaskRun>,
    max_fence: Option<FencingToken>,
}

impl RunStore {
    /// `None` 表示非Leader写入（例如Worker上报），不做检查
    fn check_fence(&mut self, fence: Option<FencingToken>) -> SchedulerResult<()> {
        let Some(presented) = fence else {
            return Ok(());
        };
        match self.max_fence {
            Some(current) if presented < current => {
                warn!("拒绝过期的fencing token {} (当前 {})", presented, current);
                Err(SchedulerError::StaleFencingToken {
                    presented: presented.0,
                    current: current.0,
                })
            }
            _ => {
                self.max_fence = Some(presented);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRunRepository {
    store: Arc<RwLock<RunStore>>,
}

impl InMemoryTaskRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn max_fence(&self) -> Option<FencingToken> {
        self.store.read().await.max_fence
    }

    pub async fn list_by_task(&self, task_id: i64) -> Vec<TaskRun> {
        let mut runs: Vec<TaskRun> = self
            .store
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }
}

#[async_trait]
impl TaskRunRepository for InMemoryTaskRunRepository {
    async fn create_run(&self, run: &TaskRun, fence: Option<FencingToken>) -> SchedulerResult<CreateOutcome> {
        let mut store = self.store.write().await;
        store.check_fence(fence)?;
        let (next, outcome) = plan_create(store.runs.get(&run.execution_id).cloned(), run);
        if let Some(next) = next {
            store.runs.insert(next.execution_id.clone(), next);
        }
        Ok(outcome)
    }

    async fn get_run(&self, execution_id: &str) -> SchedulerResult<Option<TaskRun>> {
        Ok(self.store.read().await.runs.get(execution_id).cloned())
    }

    async fn apply_update(
        &self,
        update: &ResultMessage,
        fence: Option<FencingToken>,
    ) -> SchedulerResult<ApplyOutcome> {
        let mut store = self.store.write().await;
        store.check_fence(fence)?;
        let (next, outcome) = plan_update(store.runs.get(&update.run_id).cloned(), update);
        if let Some(next) = next {
            store.runs.insert(next.execution_id.clone(), next);
        }
        outcome
    }

    async fn list_unfinished(&self, task_id: Option<i64>) -> SchedulerResult<Vec<TaskRun>> {
        let mut runs: Vec<TaskRun> = self
            .store
            .read()
            .await
            .runs
            .values()
            .filter(|r| !r.is_finished())
            .filter(|r| task_id.map_or(true, |id| r.task_id == id))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn list_retry_candidates(&self) -> SchedulerResult<Vec<TaskRun>> {
        let mut runs: Vec<TaskRun> = self
            .store
            .read()
            .await
            .runs
            .values()
            .filter(|r| is_retry_candidate(r))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn mark_retried(
        &self,
        execution_id: &str,
        retry_execution_id: &str,
        fence: Option<FencingToken>,
    ) -> SchedulerResult<bool> {
        let mut store = self.store.write().await;
        store.check_fence(fence)?;
        let (next, marked) = plan_mark_retried(store.runs.get(execution_id).cloned(), execution_id, retry_execution_id);
        if let Some(next) = next {
            store.runs.insert(next.execution_id.clone(), next);
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskfleet_core::models::{
        DispatchStatus, ExecutionStrategy, RetryPolicy, RuntimeStatus, ScheduleSpec, TaskStatus,
    };

    fn task(id: i64) -> TaskDefinition {
        TaskDefinition {
            id,
            project_id: 1,
            name: format!("task-{id}"),
            schedule: ScheduleSpec::Manual,
            execution_strategy: ExecutionStrategy::AutoSelect,
            bound_worker_id: None,
            failover_enabled: false,
            required_capabilities: vec![],
            params: serde_json::json!({"command": "true"}),
            priority: 5,
            timeout_seconds: 60,
            retry_policy: RetryPolicy::default(),
            resource_overrides: None,
            allow_overlap: false,
            status: TaskStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_run_is_idempotent_by_execution_id() {
        let repo = InMemoryTaskRunRepository::new();
        let run = TaskRun::new("exec-1", &task(1), Utc::now());
        assert!(repo.create_run(&run, None).await.unwrap().is_created());

        let mut other = run.clone();
        other.priority = 9;
        let outcome = repo.create_run(&other, None).await.unwrap();
        assert!(!outcome.is_created());
        assert_eq!(outcome.run().priority, 5);
    }

    #[tokio::test]
    async fn test_lower_fence_is_rejected() {
        let repo = InMemoryTaskRunRepository::new();
        let run = TaskRun::new("exec-1", &task(1), Utc::now());
        repo.create_run(&run, Some(FencingToken(2))).await.unwrap();

        let update = ResultMessage::dispatch("exec-1", DispatchStatus::Dispatching);
        let err = repo.apply_update(&update, Some(FencingToken(1))).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::StaleFencingToken { presented: 1, current: 2 }
        ));
        // 状态未被修改
        let stored = repo.get_run("exec-1").await.unwrap().unwrap();
        assert_eq!(stored.dispatch_status, DispatchStatus::Pending);

        // 未加fencing的Worker上报不受影响，更高的token被接受
        assert!(repo.apply_update(&update, None).await.unwrap().is_applied());
        let next = ResultMessage::dispatch("exec-1", DispatchStatus::Dispatched);
        assert!(repo
            .apply_update(&next, Some(FencingToken(3)))
            .await
            .unwrap()
            .is_applied());
        assert_eq!(repo.max_fence().await, Some(FencingToken(3)));
    }

    #[tokio::test]
    async fn test_update_for_unknown_run() {
        let repo = InMemoryTaskRunRepository::new();
        let update = ResultMessage::runtime("missing", RuntimeStatus::Running);
        assert!(matches!(
            repo.apply_update(&update, None).await,
            Err(SchedulerError::TaskRunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_candidates_and_mark_retried() {
        let repo = InMemoryTaskRunRepository::new();
        let run = TaskRun::new("exec-1", &task(1), Utc::now());
        repo.create_run(&run, None).await.unwrap();
        assert!(repo.list_retry_candidates().await.unwrap().is_empty());
        assert_eq!(repo.list_unfinished(Some(1)).await.unwrap().len(), 1);
        assert!(repo.list_unfinished(Some(2)).await.unwrap().is_empty());

        let failed = ResultMessage::runtime("exec-1", RuntimeStatus::Failed).with_error("boom");
        repo.apply_update(&failed, None).await.unwrap();
        assert_eq!(repo.list_retry_candidates().await.unwrap().len(), 1);
        assert!(repo.list_unfinished(None).await.unwrap().is_empty());

        assert!(repo.mark_retried("exec-1", "exec-2", None).await.unwrap());
        assert!(!repo.mark_retried("exec-1", "exec-3", None).await.unwrap());
        assert!(repo.list_retry_candidates().await.unwrap().is_empty());
    }

    #[test]
    fn test_rejected_update_writes_nothing_back() {
        let run = TaskRun::new("exec-1", &task(1), Utc::now());
        let skip = ResultMessage::dispatch("exec-1", DispatchStatus::Acked);
        let (next, outcome) = plan_update(Some(run.clone()), &skip);
        assert!(next.is_none());
        assert!(matches!(outcome, Ok(ApplyOutcome::Rejected(_))));

        let dispatching = ResultMessage::dispatch("exec-1", DispatchStatus::Dispatching);
        let (next, outcome) = plan_update(Some(run), &dispatching);
        assert_eq!(next.unwrap().dispatch_status, DispatchStatus::Dispatching);
        assert!(outcome.unwrap().is_applied());

        let (next, outcome) = plan_update(None, &dispatching);
        assert!(next.is_none());
        assert!(matches!(outcome, Err(SchedulerError::TaskRunNotFound { .. })));
    }

    #[tokio::test]
    async fn test_task_repository_lists_active_only() {
        let repo = InMemoryTaskRepository::new();
        repo.upsert(task(2)).await;
        let mut paused = task(1);
        paused.status = TaskStatus::Paused;
        repo.upsert(paused).await;
        let ids: Vec<i64> = repo.list_active_tasks().await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2]);
        assert!(repo.get_task(1).await.unwrap().is_some());
    }
}
