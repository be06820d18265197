use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskfleet_core::models::{
    ExecutionStrategy, ExitReason, RetryPolicy, RunOverrides, RuntimeStatus, TaskRun,
};
use taskfleet_core::traits::{TaskRepository, TaskRunRepository};
use taskfleet_core::{Backoff, SchedulerError, SchedulerResult};

use crate::leader::LeadershipHandle;
use crate::scheduler::TaskScheduler;

/// 重试实例的执行ID由原实例派生，换主后重复创建会得到同一个实例
pub fn retry_execution_id(original: &str) -> String {
    let name = format!("taskfleet:retry:{original}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// 任务级重试
///
/// 与传输层重试分开计数：只看运行实例的终态和任务的重试策略，
/// 重试总是创建新的运行实例并通过 `retry_of` 关联原实例。
pub struct TaskRetryService {
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn TaskRunRepository>,
    scheduler: Arc<TaskScheduler>,
    leadership: LeadershipHandle,
    jitter_factor: f64,
}

impl TaskRetryService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn TaskRunRepository>,
        scheduler: Arc<TaskScheduler>,
        leadership: LeadershipHandle,
        jitter_factor: f64,
    ) -> Self {
        Self {
            task_repo,
            run_repo,
            scheduler,
            leadership,
            jitter_factor,
        }
    }

    /// 第 `attempt` 次尝试失败后等待多久再重试
    pub fn calculate_retry_delay(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        let backoff = Backoff {
            base: Duration::from_secs(policy.delay_seconds),
            max: Duration::from_secs(policy.max_delay_seconds.max(policy.delay_seconds)),
            multiplier: policy.backoff_multiplier.max(1.0),
            jitter_factor: self.jitter_factor,
        };
        backoff.delay_for(attempt)
    }

    /// 按终态和策略判断失败是否值得重试
    pub fn is_retryable(run: &TaskRun, policy: &RetryPolicy) -> bool {
        if run.attempt > policy.max_retries {
            return false;
        }
        let exit_reason = run
            .result
            .as_ref()
            .and_then(|r| r.get("exit_reason"))
            .and_then(|v| serde_json::from_value::<ExitReason>(v.clone()).ok());
        if exit_reason.is_some_and(|r| r.is_resource_limit()) && !policy.retry_on_resource_limit {
            return false;
        }
        match run.runtime_status {
            RuntimeStatus::Failed => true,
            RuntimeStatus::Timeout => policy.retry_on_timeout,
            RuntimeStatus::Success | RuntimeStatus::Cancelled | RuntimeStatus::Skipped => false,
            // 派发被拒绝，从未开始执行
            RuntimeStatus::Queued | RuntimeStatus::Running => run.is_finished(),
        }
    }

    fn retry_due_at(&self, run: &TaskRun, policy: &RetryPolicy) -> DateTime<Utc> {
        let finished = run.finished_at.unwrap_or(run.created_at);
        let delay = self.calculate_retry_delay(policy, run.attempt);
        finished + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// 扫描到期的失败实例并创建重试实例
    pub async fn scan_retry_tasks(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<TaskRun>> {
        self.leadership.check().await?;
        let mut retried = Vec::new();
        for run in self.run_repo.list_retry_candidates().await? {
            let Some(task) = self.task_repo.get_task(run.task_id).await? else {
                continue;
            };
            if !task.is_active() || !Self::is_retryable(&run, &task.retry_policy) {
                continue;
            }
            if self.retry_due_at(&run, &task.retry_policy) > now {
                continue;
            }
            match self.retry(&run).await {
                Ok(retry) => retried.push(retry),
                Err(e @ SchedulerError::LeadershipLost) | Err(e @ SchedulerError::StaleFencingToken { .. }) => {
                    return Err(e)
                }
                Err(e) => warn!("重试执行实例 {} 失败: {}", run.execution_id, e),
            }
        }
        Ok(retried)
    }

    async fn retry(&self, original: &TaskRun) -> SchedulerResult<TaskRun> {
        let task = self
            .task_repo
            .get_task(original.task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: original.task_id })?;

        let mut run = TaskRun::new(retry_execution_id(&original.execution_id), &task, Utc::now());
        run.attempt = original.attempt + 1;
        run.retry_of = Some(original.execution_id.clone());
        let overrides = RunOverrides {
            strategy: Some(original.strategy),
            worker_id: match original.strategy {
                ExecutionStrategy::Specified => original.worker_id.clone(),
                _ => None,
            },
            params: Some(original.params.clone()),
            priority: Some(original.priority),
            ..Default::default()
        };

        // 先派发再标记：两步之间换主时，新Leader会得到同一个重试实例
        let submitted = match self.scheduler.submit(&task, run, Some(&overrides)).await {
            Ok(run) => run,
            Err(e @ SchedulerError::LeadershipLost) | Err(e @ SchedulerError::StaleFencingToken { .. }) => {
                return Err(e)
            }
            Err(e) => {
                // 派发失败的重试实例已经记录为failed，本身会进入下一轮重试判断
                debug!("重试实例派发失败: {}", e);
                self.run_repo
                    .get_run(&retry_execution_id(&original.execution_id))
                    .await?
                    .ok_or(e)?
            }
        };
        let fence = self.leadership.check().await?;
        self.run_repo
            .mark_retried(&original.execution_id, &submitted.execution_id, Some(fence))
            .await?;
        metrics::counter!("taskfleet_runs_retried_total").increment(1);
        info!(
            "执行实例 {} 失败，创建重试实例 {} (第{}次尝试)",
            original.execution_id, submitted.execution_id, submitted.attempt
        );
        Ok(submitted)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.leadership.is_leader().await {
                        continue;
                    }
                    if let Err(e) = self.scan_retry_tasks(Utc::now()).await {
                        warn!("重试扫描失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("重试循环已停止");
                    break;
                }
            }
        }
    }
}
