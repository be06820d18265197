//! 调度核心
//!
//! 只在Leader上运行：按调度规则扫描到期任务、处理手动触发请求，为每次运行
//! 解析目标Worker并写入该Worker的任务分区。所有对运行实例的写入都带上当前
//! 的fencing token。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use taskfleet_core::models::{
    DispatchStatus, ResultMessage, RunOverrides, RuntimeStatus, TaskDefinition, TaskReadyPayload,
    TaskRun,
};
use taskfleet_core::partitions;
use taskfleet_core::traits::{enqueue_message, TaskQueue, TaskRepository, TaskRunRepository};
use taskfleet_core::{ApplyOutcome, SchedulerError, SchedulerResult};

use crate::cron_utils::due_fire_time;
use crate::leader::LeadershipHandle;
use crate::resolver::ExecutionResolver;

/// 手动触发请求
pub struct TriggerRequest {
    pub task_id: i64,
    pub overrides: Option<RunOverrides>,
    pub reply: oneshot::Sender<SchedulerResult<TaskRun>>,
}

/// 向调度循环提交手动触发请求
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<TriggerRequest>,
}

impl TriggerHandle {
    pub async fn trigger(&self, task_id: i64, overrides: Option<RunOverrides>) -> SchedulerResult<TaskRun> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TriggerRequest {
                task_id,
                overrides,
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Internal("调度循环已停止".to_string()))?;
        rx.await
            .map_err(|_| SchedulerError::Internal("调度循环未回复触发请求".to_string()))?
    }
}

pub fn trigger_channel(capacity: usize) -> (TriggerHandle, mpsc::Receiver<TriggerRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (TriggerHandle { tx }, rx)
}

/// 定时触发的运行使用确定性的执行ID，换主后新Leader对同一触发点重复创建时
/// 会得到已有实例
pub fn scheduled_execution_id(task_id: i64, fire_time: DateTime<Utc>) -> String {
    let name = format!("taskfleet:{}:{}", task_id, fire_time.timestamp_millis());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

pub struct TaskScheduler {
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn TaskRunRepository>,
    queue: Arc<dyn TaskQueue>,
    resolver: Arc<ExecutionResolver>,
    leadership: LeadershipHandle,
    last_fire: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl TaskScheduler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn TaskRunRepository>,
        queue: Arc<dyn TaskQueue>,
        resolver: Arc<ExecutionResolver>,
        leadership: LeadershipHandle,
    ) -> Self {
        Self {
            task_repo,
            run_repo,
            queue,
            resolver,
            leadership,
            last_fire: Mutex::new(HashMap::new()),
        }
    }

    /// 扫描所有活跃任务，为到期的任务创建并派发运行实例
    pub async fn scan_and_schedule(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<TaskRun>> {
        self.leadership.check().await?;
        let tasks = self.task_repo.list_active_tasks().await?;
        let mut scheduled = Vec::new();

        for task in tasks {
            match self.schedule_if_due(&task, now).await {
                Ok(Some(run)) => scheduled.push(run),
                Ok(None) => {}
                Err(SchedulerError::LeadershipLost) | Err(SchedulerError::StaleFencingToken { .. }) => {
                    warn!("调度扫描中失去领导权，中止本轮");
                    return Err(SchedulerError::LeadershipLost);
                }
                Err(e) => error!("调度任务 {} 失败: {}", task.id, e),
            }
        }

        if !scheduled.is_empty() {
            info!("本次调度完成，共调度了 {} 个任务", scheduled.len());
        }
        Ok(scheduled)
    }

    async fn schedule_if_due(&self, task: &TaskDefinition, now: DateTime<Utc>) -> SchedulerResult<Option<TaskRun>> {
        let last = self.last_fire.lock().await.get(&task.id).copied();
        let Some(fire_time) = due_fire_time(&task.schedule, last, now)? else {
            return Ok(None);
        };
        // 这个触发点无论是否真正派发都算消费掉
        self.last_fire.lock().await.insert(task.id, fire_time);

        if !task.allow_overlap {
            let unfinished = self.run_repo.list_unfinished(Some(task.id)).await?;
            if let Some(running) = unfinished.first() {
                debug!(
                    "任务 {} 仍有未结束的运行 {}，跳过触发点 {}",
                    task.id, running.execution_id, fire_time
                );
                metrics::counter!("taskfleet_schedules_skipped_total", "reason" => "overlap").increment(1);
                return Ok(None);
            }
        }

        let run = TaskRun::new(scheduled_execution_id(task.id, fire_time), task, fire_time);
        self.submit(task, run, None).await.map(Some)
    }

    /// 手动触发；调用方提供的执行ID已存在时直接返回已有实例
    ///
    /// 手动触发不受重叠保护限制。
    pub async fn trigger(&self, task_id: i64, overrides: Option<RunOverrides>) -> SchedulerResult<TaskRun> {
        self.leadership.check().await?;
        let task = self
            .task_repo
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        info!("手动触发任务 {} ({})", task.id, task.name);

        let execution_id = overrides
            .as_ref()
            .and_then(|o| o.execution_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let run = TaskRun::new(execution_id, &task, Utc::now());
        self.submit(&task, run, overrides.as_ref()).await
    }

    /// 创建运行实例并派发；实例已存在时原样返回
    pub async fn submit(
        &self,
        task: &TaskDefinition,
        mut run: TaskRun,
        overrides: Option<&RunOverrides>,
    ) -> SchedulerResult<TaskRun> {
        run.strategy = task.effective_strategy(overrides);
        if let Some(o) = overrides {
            if let Some(priority) = o.priority {
                run.priority = priority;
            }
            if let Some(params) = &o.params {
                run.params = params.clone();
            }
            if o.worker_id.is_some() {
                run.worker_id = o.worker_id.clone();
            }
        }

        let fence = self.leadership.check().await?;
        let outcome = self.run_repo.create_run(&run, Some(fence)).await?;
        if !outcome.is_created() {
            info!("执行实例 {} 已存在，返回已有实例", run.execution_id);
            return Ok(outcome.into_run());
        }
        info!(
            "为任务 {} 创建了新的执行实例 {} (第{}次尝试)",
            task.name, run.execution_id, run.attempt
        );

        self.dispatch(task, &run, overrides).await?;
        self.current(&run.execution_id).await
    }

    /// 解析Worker并写入任务分区
    ///
    /// 也用于重新派发卡在 dispatching 的实例。解析失败时两条轨道都标记为
    /// failed 并返回原始错误。
    pub async fn dispatch(
        &self,
        task: &TaskDefinition,
        run: &TaskRun,
        overrides: Option<&RunOverrides>,
    ) -> SchedulerResult<()> {
        let span = info_span!("dispatch", execution_id = %run.execution_id, task_id = task.id);
        async move {
            self.record(ResultMessage::dispatch(&run.execution_id, DispatchStatus::Dispatching))
                .await?;

            let effective = RunOverrides {
                strategy: Some(run.strategy),
                worker_id: run.worker_id.clone(),
                ..overrides.cloned().unwrap_or_default()
            };
            let resolution = match self.resolver.resolve(task, Some(&effective)).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!("执行实例 {} 解析Worker失败: {}", run.execution_id, e);
                    self.fail(&run.execution_id, &format!("无法分配Worker: {e}")).await?;
                    return Err(e);
                }
            };

            let payload = TaskReadyPayload {
                execution_id: run.execution_id.clone(),
                task_id: task.id,
                project_id: task.project_id,
                params: run.params.clone(),
                priority: run.priority,
                enqueue_time: Utc::now(),
                timeout_seconds: run.timeout_seconds,
                attempt: run.attempt,
                resource_limits: task.resource_overrides.clone(),
            };
            let partition = partitions::tasks(&resolution.worker_id);
            let entry_id = match enqueue_message(self.queue.as_ref(), &partition, &payload).await {
                Ok(entry_id) => entry_id,
                Err(e) => {
                    error!("执行实例 {} 写入分区 {} 失败: {}", run.execution_id, partition, e);
                    self.fail(&run.execution_id, &format!("写入任务队列失败: {e}")).await?;
                    return Err(e);
                }
            };

            let mut dispatched = ResultMessage::dispatch(&run.execution_id, DispatchStatus::Dispatched)
                .with_worker(&resolution.worker_id);
            dispatched.entry_id = Some(entry_id);
            self.record(dispatched).await?;

            metrics::counter!("taskfleet_runs_dispatched_total", "strategy" => resolution.strategy.to_string())
                .increment(1);
            info!(
                "执行实例 {} 已派发到Worker {} (策略: {}, 回退: {})",
                run.execution_id, resolution.worker_id, resolution.strategy, resolution.fell_back
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn fail(&self, execution_id: &str, message: &str) -> SchedulerResult<()> {
        self.record(ResultMessage::dispatch(execution_id, DispatchStatus::Failed).with_error(message))
            .await?;
        self.record(ResultMessage::runtime(execution_id, RuntimeStatus::Failed).with_error(message))
            .await?;
        metrics::counter!("taskfleet_runs_dispatch_failed_total").increment(1);
        Ok(())
    }

    /// 带fencing地应用一条Leader侧的状态更新
    async fn record(&self, update: ResultMessage) -> SchedulerResult<ApplyOutcome> {
        let update = update.from_dispatcher();
        let fence = self.leadership.check().await?;
        let outcome = self.run_repo.apply_update(&update, Some(fence)).await?;
        if let ApplyOutcome::Rejected(reason) = &outcome {
            warn!("执行实例 {} 的状态更新 {} 被拒绝: {}", update.run_id, update.status, reason);
        }
        Ok(outcome)
    }

    async fn current(&self, execution_id: &str) -> SchedulerResult<TaskRun> {
        self.run_repo
            .get_run(execution_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskRunNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// 调度循环：定时扫描，同时处理手动触发请求
    pub async fn run(
        self: Arc<Self>,
        scan_interval: Duration,
        mut trigger_rx: mpsc::Receiver<TriggerRequest>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.leadership.is_leader().await {
                        continue;
                    }
                    if let Err(e) = self.scan_and_schedule(Utc::now()).await {
                        warn!("调度扫描失败: {}", e);
                    }
                }
                Some(request) = trigger_rx.recv() => {
                    let result = self.trigger(request.task_id, request.overrides).await;
                    if request.reply.send(result).is_err() {
                        debug!("手动触发的调用方已放弃等待");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("调度循环已停止");
                    break;
                }
            }
        }
    }
}
