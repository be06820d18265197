use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskfleet_core::models::{ControlMessage, ResultMessage, RuntimeReply, RuntimeStatus};
use taskfleet_core::partitions::{self, DISPATCHERS_GROUP, GLOBAL_CONTROL};
use taskfleet_core::traits::{enqueue_message, TaskQueue, TaskRunRepository};
use taskfleet_core::{SchedulerError, SchedulerResult};

use crate::leader::LeadershipHandle;

/// 取消请求的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// 已经向持有该实例的Worker发送取消消息
    Signalled { worker_id: String },
    /// 实例尚未到达任何Worker，直接标记为已取消
    CancelledBeforeDispatch,
}

/// 控制面操作：取消运行、推送配置、运行时管理
///
/// 控制消息都走 `control:{worker_id}` / `control:global` 分区，
/// 与任务分区互不影响。
pub struct TaskController {
    run_repo: Arc<dyn TaskRunRepository>,
    queue: Arc<dyn TaskQueue>,
    leadership: LeadershipHandle,
    consumer: String,
    reply_ttl: Duration,
    manage_timeout: Duration,
}

impl TaskController {
    pub fn new(
        run_repo: Arc<dyn TaskRunRepository>,
        queue: Arc<dyn TaskQueue>,
        leadership: LeadershipHandle,
        consumer: impl Into<String>,
        reply_ttl: Duration,
        manage_timeout: Duration,
    ) -> Self {
        Self {
            run_repo,
            queue,
            leadership,
            consumer: consumer.into(),
            reply_ttl,
            manage_timeout,
        }
    }

    pub async fn cancel_run(&self, execution_id: &str, reason: &str) -> SchedulerResult<CancelOutcome> {
        let run = self
            .run_repo
            .get_run(execution_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskRunNotFound {
                execution_id: execution_id.to_string(),
            })?;
        if run.is_finished() {
            return Err(SchedulerError::InvalidTransition {
                from: run.runtime_status.to_string(),
                to: RuntimeStatus::Cancelled.to_string(),
            });
        }

        let Some(worker_id) = run.worker_id.clone() else {
            let fence = self.leadership.check().await?;
            let update = ResultMessage::runtime(execution_id, RuntimeStatus::Cancelled)
                .with_error(format!("派发前被取消: {reason}"))
                .from_dispatcher();
            self.run_repo.apply_update(&update, Some(fence)).await?;
            info!("执行实例 {} 在派发前被取消", execution_id);
            return Ok(CancelOutcome::CancelledBeforeDispatch);
        };

        let message = ControlMessage::Cancel {
            task_id: run.task_id,
            run_id: execution_id.to_string(),
            reason: reason.to_string(),
        };
        enqueue_message(self.queue.as_ref(), &partitions::control(&worker_id), &message).await?;
        info!("已向Worker {} 发送取消执行实例 {} 的请求", worker_id, execution_id);
        Ok(CancelOutcome::Signalled { worker_id })
    }

    /// 推送配置；`worker_id` 为空时写入全局控制分区
    pub async fn push_config(&self, worker_id: Option<&str>, config: serde_json::Value) -> SchedulerResult<String> {
        let partition = match worker_id {
            Some(id) => partitions::control(id),
            None => GLOBAL_CONTROL.to_string(),
        };
        let entry_id = enqueue_message(self.queue.as_ref(), &partition, &ControlMessage::ConfigUpdate { config }).await?;
        debug!("配置更新已写入 {} ({})", partition, entry_id);
        Ok(entry_id)
    }

    /// 向Worker发送运行时管理指令并等待回复
    pub async fn runtime_manage(
        &self,
        worker_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> SchedulerResult<RuntimeReply> {
        let request_id = Uuid::new_v4().to_string();
        let reply_stream = partitions::reply(&request_id);
        let message = ControlMessage::RuntimeManage {
            action: action.to_string(),
            request_id: request_id.clone(),
            reply_stream: reply_stream.clone(),
            payload,
        };
        enqueue_message(self.queue.as_ref(), &partitions::control(worker_id), &message).await?;

        let result = self.wait_for_reply(&reply_stream, &request_id).await;
        // 回复通道只用一次
        if let Err(e) = self.queue.expire(&reply_stream, self.reply_ttl).await {
            warn!("设置回复通道 {} 过期时间失败: {}", reply_stream, e);
        }
        match result? {
            Some(reply) => Ok(reply),
            None => Err(SchedulerError::WorkerUnavailable {
                worker_id: worker_id.to_string(),
                reason: format!("{} 秒内没有回复 {}", self.manage_timeout.as_secs(), action),
            }),
        }
    }

    async fn wait_for_reply(&self, reply_stream: &str, request_id: &str) -> SchedulerResult<Option<RuntimeReply>> {
        let deadline = Instant::now() + self.manage_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let entries = self
                .queue
                .consume(reply_stream, DISPATCHERS_GROUP, &self.consumer, 1, Some(remaining))
                .await?;
            for entry in entries {
                self.queue.ack(reply_stream, DISPATCHERS_GROUP, &[entry.entry_id.clone()]).await?;
                match entry.decode::<RuntimeReply>() {
                    Ok(reply) if reply.request_id == request_id => return Ok(Some(reply)),
                    Ok(reply) => debug!("忽略不匹配的回复 {}", reply.request_id),
                    Err(e) => warn!("无法解析的运行时管理回复: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{task_definition, Fixture};
    use taskfleet_core::models::QueueEntry;
    use taskfleet_core::partitions::WORKERS_GROUP;

    fn controller(fx: &Fixture, timeout: Duration) -> TaskController {
        TaskController::new(
            Arc::new(fx.runs.clone()),
            Arc::new(fx.queue.clone()),
            fx.leadership.clone(),
            "node-a",
            Duration::from_secs(60),
            timeout,
        )
    }

    async fn next_control(fx: &Fixture, partition: &str) -> QueueEntry {
        fx.queue
            .consume(partition, WORKERS_GROUP, "w", 1, None)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_cancel_dispatched_run_signals_worker() {
        let fx = Fixture::with_workers(&["w1"]).await;
        fx.tasks.upsert(task_definition(1)).await;
        let run = fx.scheduler.trigger(1, None).await.unwrap();

        let outcome = controller(&fx, Duration::from_secs(1))
            .cancel_run(&run.execution_id, "用户取消")
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::Signalled { worker_id: "w1".to_string() });

        let message: ControlMessage = next_control(&fx, "control:w1").await.decode().unwrap();
        assert_eq!(
            message,
            ControlMessage::Cancel {
                task_id: 1,
                run_id: run.execution_id.clone(),
                reason: "用户取消".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_finished_run_is_rejected() {
        let fx = Fixture::with_workers(&[]).await;
        fx.tasks.upsert(task_definition(1)).await;
        // 没有Worker，派发失败后实例已结束
        let _ = fx.scheduler.trigger(1, None).await;
        let runs = fx.runs.list_by_task(1).await;
        let result = controller(&fx, Duration::from_secs(1))
            .cancel_run(&runs[0].execution_id, "x")
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_push_config_global_and_targeted() {
        let fx = Fixture::with_workers(&["w1"]).await;
        let c = controller(&fx, Duration::from_secs(1));
        c.push_config(None, serde_json::json!({"queue_capacity": 8})).await.unwrap();
        c.push_config(Some("w1"), serde_json::json!({"aging_interval_seconds": 5}))
            .await
            .unwrap();
        assert_eq!(fx.queue.len(GLOBAL_CONTROL).await.unwrap(), 1);
        assert_eq!(fx.queue.len("control:w1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_runtime_manage_waits_for_reply() {
        let fx = Fixture::with_workers(&["w1"]).await;
        let c = controller(&fx, Duration::from_secs(5));

        let queue = fx.queue.clone();
        let worker = tokio::spawn(async move {
            let entry = queue
                .consume("control:w1", WORKERS_GROUP, "w", 1, Some(Duration::from_secs(5)))
                .await
                .unwrap()
                .remove(0);
            let ControlMessage::RuntimeManage { request_id, reply_stream, .. } = entry.decode().unwrap() else {
                panic!("unexpected control message");
            };
            let reply = RuntimeReply {
                request_id,
                worker_id: "w1".to_string(),
                ok: true,
                data: serde_json::json!({"running": 0}),
                error: None,
            };
            enqueue_message(&queue, &reply_stream, &reply).await.unwrap();
        });

        let reply = c.runtime_manage("w1", "status", serde_json::Value::Null).await.unwrap();
        worker.await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.data["running"], 0);
    }

    #[tokio::test]
    async fn test_runtime_manage_times_out() {
        let fx = Fixture::with_workers(&["w1"]).await;
        let c = controller(&fx, Duration::from_millis(50));
        let result = c.runtime_manage("w1", "drain", serde_json::Value::Null).await;
        assert!(matches!(result, Err(SchedulerError::WorkerUnavailable { .. })));
    }
}
