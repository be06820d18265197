//! 状态对账
//!
//! 周期性检查未结束的运行实例，修正消息丢失或节点崩溃留下的中间状态：
//! - 派发后迟迟没有收到确认：`dispatch=timeout`
//! - 卡在 pending/dispatching（上一任Leader在派发途中退出）：重新派发
//! - 持有实例的Worker失联超过宽限期：`runtime=failed`，交给重试服务

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use taskfleet_core::config::DispatcherConfig;
use taskfleet_core::models::{DispatchStatus, ResultMessage, RuntimeStatus, TaskRun};
use taskfleet_core::traits::{TaskRepository, TaskRunRepository, WorkerRegistry};
use taskfleet_core::{ApplyOutcome, SchedulerError, SchedulerResult};

use crate::leader::LeadershipHandle;
use crate::scheduler::TaskScheduler;

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub ack_timeout: ChronoDuration,
    pub dispatching_stuck: ChronoDuration,
    pub worker_lost_grace: ChronoDuration,
}

impl From<&DispatcherConfig> for ReconcileSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            ack_timeout: ChronoDuration::seconds(config.dispatch_ack_timeout_seconds as i64),
            dispatching_stuck: ChronoDuration::seconds(config.dispatching_stuck_seconds as i64),
            worker_lost_grace: ChronoDuration::seconds(config.worker_lost_grace_seconds as i64),
        }
    }
}

/// 一轮对账的结果统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub ack_timeouts: usize,
    pub redispatched: usize,
    pub worker_lost: usize,
}

pub struct Reconciler {
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn TaskRunRepository>,
    registry: Arc<dyn WorkerRegistry>,
    scheduler: Arc<TaskScheduler>,
    leadership: LeadershipHandle,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn TaskRunRepository>,
        registry: Arc<dyn WorkerRegistry>,
        scheduler: Arc<TaskScheduler>,
        leadership: LeadershipHandle,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            task_repo,
            run_repo,
            registry,
            scheduler,
            leadership,
            settings,
        }
    }

    pub async fn reconcile(&self, now: DateTime<Utc>) -> SchedulerResult<ReconcileReport> {
        self.leadership.check().await?;
        let mut report = ReconcileReport::default();

        for run in self.run_repo.list_unfinished(None).await? {
            let result = match run.dispatch_status {
                DispatchStatus::Pending | DispatchStatus::Dispatching => {
                    self.redispatch_if_stuck(&run, now, &mut report).await
                }
                DispatchStatus::Dispatched => {
                    match self.check_ack_timeout(&run, now, &mut report).await {
                        Ok(()) => self.check_worker_lost(&run, now, &mut report).await,
                        Err(e) => Err(e),
                    }
                }
                DispatchStatus::Acked | DispatchStatus::Timeout => {
                    self.check_worker_lost(&run, now, &mut report).await
                }
                DispatchStatus::Rejected | DispatchStatus::Failed => Ok(()),
            };
            match result {
                Ok(()) => {}
                Err(e @ SchedulerError::LeadershipLost) | Err(e @ SchedulerError::StaleFencingToken { .. }) => {
                    return Err(e)
                }
                Err(e) => warn!("对账执行实例 {} 失败: {}", run.execution_id, e),
            }
        }

        if report != ReconcileReport::default() {
            info!(
                "对账完成: 确认超时 {}，重新派发 {}，Worker失联 {}",
                report.ack_timeouts, report.redispatched, report.worker_lost
            );
        }
        Ok(report)
    }

    async fn redispatch_if_stuck(
        &self,
        run: &TaskRun,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> SchedulerResult<()> {
        let since = match run.dispatch_status {
            DispatchStatus::Dispatching => millis_to_datetime(run.dispatch_reported_at).unwrap_or(run.created_at),
            _ => run.created_at,
        };
        if now - since < self.settings.dispatching_stuck {
            return Ok(());
        }

        let Some(task) = self.task_repo.get_task(run.task_id).await? else {
            let message = format!("任务 {} 已不存在", run.task_id);
            self.record(ResultMessage::dispatch(&run.execution_id, DispatchStatus::Failed).with_error(&message))
                .await?;
            self.record(ResultMessage::runtime(&run.execution_id, RuntimeStatus::Failed).with_error(&message))
                .await?;
            return Ok(());
        };

        warn!(
            "执行实例 {} 卡在 {} 超过 {} 秒，重新派发",
            run.execution_id,
            run.dispatch_status,
            self.settings.dispatching_stuck.num_seconds()
        );
        report.redispatched += 1;
        metrics::counter!("taskfleet_runs_redispatched_total").increment(1);
        self.scheduler.dispatch(&task, run, None).await
    }

    async fn check_ack_timeout(
        &self,
        run: &TaskRun,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> SchedulerResult<()> {
        if run.runtime_status != RuntimeStatus::Queued {
            return Ok(());
        }
        let Some(dispatched_at) = run.dispatched_at else {
            return Ok(());
        };
        if now - dispatched_at < self.settings.ack_timeout {
            return Ok(());
        }
        let message = format!(
            "Worker {} 在 {} 秒内没有确认",
            run.worker_id.as_deref().unwrap_or("-"),
            self.settings.ack_timeout.num_seconds()
        );
        if self
            .record(ResultMessage::dispatch(&run.execution_id, DispatchStatus::Timeout).with_error(message))
            .await?
            .is_applied()
        {
            report.ack_timeouts += 1;
            metrics::counter!("taskfleet_dispatch_ack_timeouts_total").increment(1);
        }
        Ok(())
    }

    /// 存活键已经过期，且最后一次心跳早于宽限期
    async fn check_worker_lost(
        &self,
        run: &TaskRun,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> SchedulerResult<()> {
        let Some(worker_id) = run.worker_id.as_deref() else {
            return Ok(());
        };
        if self.registry.probe(worker_id).await? {
            return Ok(());
        }
        let last_seen = self.registry.get_worker(worker_id).await?.map(|w| w.last_heartbeat);
        if let Some(last_seen) = last_seen {
            if now - last_seen < self.settings.worker_lost_grace {
                debug!("Worker {} 心跳缺失但仍在宽限期内", worker_id);
                return Ok(());
            }
        }

        let message = format!("Worker {worker_id} 已失联");
        if self
            .record(ResultMessage::runtime(&run.execution_id, RuntimeStatus::Failed).with_error(&message))
            .await?
            .is_applied()
        {
            warn!("执行实例 {} 所在的 {}，标记为失败", run.execution_id, message);
            report.worker_lost += 1;
            metrics::counter!("taskfleet_runs_worker_lost_total").increment(1);
        }
        Ok(())
    }

    async fn record(&self, update: ResultMessage) -> SchedulerResult<ApplyOutcome> {
        let fence = self.leadership.check().await?;
        self.run_repo.apply_update(&update.from_dispatcher(), Some(fence)).await
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
                    if let Err(e) = self.reconcile(Utc::now()).await {
                        warn!("对账失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("对账循环已停止");
                    break;
                }
            }
        }
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{task_definition, worker_node, Fixture};
    use taskfleet_core::traits::TaskQueue;

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            ack_timeout: ChronoDuration::seconds(60),
            dispatching_stuck: ChronoDuration::seconds(30),
            worker_lost_grace: ChronoDuration::seconds(60),
        }
    }

    fn reconciler(fx: &Fixture) -> Reconciler {
        Reconciler::new(
            Arc::new(fx.tasks.clone()),
            Arc::new(fx.runs.clone()),
            Arc::new(fx.registry.clone()),
            fx.scheduler.clone(),
            fx.leadership.clone(),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_unacked_dispatch_times_out() {
        let fx = Fixture::with_workers(&["w1"]).await;
        fx.tasks.upsert(task_definition(1)).await;
        let run = fx.scheduler.trigger(1, None).await.unwrap();
        let r = reconciler(&fx);

        let report = r.reconcile(Utc::now()).await.unwrap();
        assert_eq!(report, ReconcileReport::default());

        let report = r.reconcile(Utc::now() + ChronoDuration::seconds(61)).await.unwrap();
        assert_eq!(report.ack_timeouts, 1);
        let run = fx.runs.get_run(&run.execution_id).await.unwrap().unwrap();
        assert_eq!(run.dispatch_status, DispatchStatus::Timeout);
        assert_eq!(run.runtime_status, RuntimeStatus::Queued);
    }

    #[tokio::test]
    async fn test_stuck_dispatching_is_redispatched() {
        let fx = Fixture::with_workers(&["w1"]).await;
        let task = task_definition(1);
        fx.tasks.upsert(task.clone()).await;

        let run = TaskRun::new("stuck-1", &task, Utc::now());
        fx.runs.create_run(&run, Some(fx.fence)).await.unwrap();
        let earlier = (Utc::now() - ChronoDuration::seconds(45)).timestamp_millis();
        fx.runs
            .apply_update(
                &ResultMessage::dispatch("stuck-1", DispatchStatus::Dispatching).with_reported_at(earlier),
                Some(fx.fence),
            )
            .await
            .unwrap();

        let report = reconciler(&fx).reconcile(Utc::now()).await.unwrap();
        assert_eq!(report.redispatched, 1);
        let run = fx.runs.get_run("stuck-1").await.unwrap().unwrap();
        assert_eq!(run.dispatch_status, DispatchStatus::Dispatched);
        assert_eq!(run.worker_id.as_deref(), Some("w1"));
        assert_eq!(fx.queue.len("tasks:w1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_on_lost_worker_fails_after_grace() {
        let fx = Fixture::with_workers(&["w1"]).await;
        fx.tasks.upsert(task_definition(1)).await;
        let run = fx.scheduler.trigger(1, None).await.unwrap();
        fx.runs
            .apply_update(
                &ResultMessage::dispatch(&run.execution_id, DispatchStatus::Acked).with_worker("w1"),
                None,
            )
            .await
            .unwrap();

        // 存活键过期，最后心跳在30秒前：仍在宽限期内
        let mut node = worker_node("w1", 1, 4);
        node.last_heartbeat = Utc::now() - ChronoDuration::seconds(30);
        fx.registry.upsert_stale(node.clone()).await;
        let r = reconciler(&fx);
        assert_eq!(r.reconcile(Utc::now()).await.unwrap().worker_lost, 0);

        node.last_heartbeat = Utc::now() - ChronoDuration::seconds(120);
        fx.registry.upsert_stale(node).await;
        assert_eq!(r.reconcile(Utc::now()).await.unwrap().worker_lost, 1);

        let run = fx.runs.get_run(&run.execution_id).await.unwrap().unwrap();
        assert_eq!(run.runtime_status, RuntimeStatus::Failed);
        assert!(run.error_message.unwrap().contains("w1"));
    }

    #[tokio::test]
    async fn test_deposed_leader_reconciles_nothing() {
        let fx = Fixture::with_workers(&["w1"]).await;
        fx.tasks.upsert(task_definition(1)).await;
        fx.scheduler.trigger(1, None).await.unwrap();
        // 新Leader写入了更大的token
        let other = TaskRun::new("other", &task_definition(1), Utc::now());
        fx.runs
            .create_run(&other, Some(taskfleet_core::FencingToken(fx.fence.0 + 1)))
            .await
            .unwrap();

        let result = reconciler(&fx)
            .reconcile(Utc::now() + ChronoDuration::seconds(120))
            .await;
        assert!(matches!(result, Err(SchedulerError::StaleFencingToken { .. })));
    }
}
