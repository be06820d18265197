use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use taskfleet_core::models::{HeartbeatMessage, LogChunk, QueueEntry, ResultMessage, RuntimeReply};
use taskfleet_core::partitions;
use taskfleet_core::traits::queue::enqueue_message;
use taskfleet_core::traits::{TaskQueue, WorkerRegistry};
use taskfleet_core::SchedulerResult;

use super::WorkerChannel;

pub struct DirectChannel {
    queue: Arc<dyn TaskQueue>,
    registry: Arc<dyn WorkerRegistry>,
    consumer: String,
    tasks: String,
    control: String,
    control_group: String,
}

impl DirectChannel {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        registry: Arc<dyn WorkerRegistry>,
        worker_id: &str,
        boot_id: &str,
    ) -> Self {
        Self {
            queue,
            registry,
            consumer: partitions::worker_consumer(worker_id, boot_id),
            tasks: partitions::tasks(worker_id),
            control: partitions::control(worker_id),
            control_group: partitions::control_group(worker_id),
        }
    }
}

#[async_trait]
impl WorkerChannel for DirectChannel {
    async fn heartbeat(&self, heartbeat: &HeartbeatMessage, ttl: Duration) -> SchedulerResult<()> {
        self.registry.record_heartbeat(heartbeat, ttl).await
    }

    async fn poll_tasks(&self, count: usize, block: Option<Duration>) -> SchedulerResult<Vec<QueueEntry>> {
        self.queue
            .consume(&self.tasks, partitions::WORKERS_GROUP, &self.consumer, count, block)
            .await
    }

    async fn ack_tasks(&self, entry_ids: &[String]) -> SchedulerResult<usize> {
        self.queue.ack(&self.tasks, partitions::WORKERS_GROUP, entry_ids).await
    }

    async fn reclaim_tasks(&self, min_idle: Duration, count: usize) -> SchedulerResult<Vec<QueueEntry>> {
        self.queue
            .reclaim(&self.tasks, partitions::WORKERS_GROUP, &self.consumer, min_idle, count)
            .await
    }

    async fn renew_tasks(&self, entry_ids: &[String]) -> SchedulerResult<usize> {
        self.queue
            .renew(&self.tasks, partitions::WORKERS_GROUP, &self.consumer, entry_ids)
            .await
    }

    async fn publish_result(&self, result: &ResultMessage) -> SchedulerResult<()> {
        enqueue_message(self.queue.as_ref(), partitions::RESULTS, result).await?;
        Ok(())
    }

    async fn publish_logs(&self, chunk: &LogChunk) -> SchedulerResult<()> {
        enqueue_message(self.queue.as_ref(), partitions::LOGS, chunk).await?;
        Ok(())
    }

    async fn poll_control(&self, count: usize, block: Option<Duration>) -> SchedulerResult<Vec<QueueEntry>> {
        // 全局分区不阻塞，只在专属分区上等待
        let mut entries = self
            .queue
            .consume(partitions::GLOBAL_CONTROL, &self.control_group, &self.consumer, count, None)
            .await?;
        let remaining = count.saturating_sub(entries.len());
        if remaining > 0 {
            let block = if entries.is_empty() { block } else { None };
            entries.extend(
                self.queue
                    .consume(&self.control, &self.control_group, &self.consumer, remaining, block)
                    .await?,
            );
        }
        Ok(entries)
    }

    async fn ack_control(&self, partition: &str, entry_ids: &[String]) -> SchedulerResult<usize> {
        self.queue.ack(partition, &self.control_group, entry_ids).await
    }

    async fn reclaim_control(&self, min_idle: Duration, count: usize) -> SchedulerResult<Vec<QueueEntry>> {
        let mut entries = self
            .queue
            .reclaim(partitions::GLOBAL_CONTROL, &self.control_group, &self.consumer, min_idle, count)
            .await?;
        let remaining = count.saturating_sub(entries.len());
        if remaining > 0 {
            entries.extend(
                self.queue
                    .reclaim(&self.control, &self.control_group, &self.consumer, min_idle, remaining)
                    .await?,
            );
        }
        Ok(entries)
    }

    async fn reply(&self, reply_stream: &str, reply: &RuntimeReply) -> SchedulerResult<()> {
        enqueue_message(self.queue.as_ref(), reply_stream, reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskfleet_core::models::ControlMessage;
    use taskfleet_infrastructure::{InMemoryStreamQueue, InMemoryWorkerRegistry};

    fn channel(queue: Arc<InMemoryStreamQueue>, worker_id: &str, boot_id: &str) -> DirectChannel {
        DirectChannel::new(queue, Arc::new(InMemoryWorkerRegistry::new()), worker_id, boot_id)
    }

    #[tokio::test]
    async fn test_global_control_fans_out_to_every_worker() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let w1 = channel(queue.clone(), "w1", "b1");
        let w2 = channel(queue.clone(), "w2", "b1");
        let message = ControlMessage::ConfigUpdate {
            config: serde_json::json!({"queue_capacity": 5}),
        };
        enqueue_message(queue.as_ref(), partitions::GLOBAL_CONTROL, &message)
            .await
            .unwrap();
        enqueue_message(queue.as_ref(), &partitions::control("w1"), &message)
            .await
            .unwrap();

        let w1_entries = w1.poll_control(10, None).await.unwrap();
        let w2_entries = w2.poll_control(10, None).await.unwrap();
        assert_eq!(w1_entries.len(), 2);
        assert_eq!(w2_entries.len(), 1);
        assert_eq!(w2_entries[0].partition, partitions::GLOBAL_CONTROL);

        let ids = vec![w2_entries[0].entry_id.clone()];
        assert_eq!(w2.ack_control(partitions::GLOBAL_CONTROL, &ids).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restarted_incarnation_reclaims_entries() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        queue
            .enqueue(&partitions::tasks("w1"), &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let old = channel(queue.clone(), "w1", "boot-a");
        assert_eq!(old.poll_tasks(10, None).await.unwrap().len(), 1);

        let new = channel(queue.clone(), "w1", "boot-b");
        assert!(new.poll_tasks(10, None).await.unwrap().is_empty());
        let reclaimed = new.reclaim_tasks(Duration::ZERO, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].delivery_count, 2);
        assert_eq!(new.ack_tasks(&[reclaimed[0].entry_id.clone()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unacked_cancel_survives_restart() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let cancel = ControlMessage::Cancel {
            task_id: 1,
            run_id: "run-1".to_string(),
            reason: "user".to_string(),
        };
        enqueue_message(queue.as_ref(), &partitions::control("w1"), &cancel)
            .await
            .unwrap();

        // 旧实例读到取消消息后崩溃，没有确认
        let old = channel(queue.clone(), "w1", "boot-a");
        assert_eq!(old.poll_control(10, None).await.unwrap().len(), 1);

        let new = channel(queue.clone(), "w1", "boot-b");
        assert!(new.poll_control(10, None).await.unwrap().is_empty());
        let reclaimed = new.reclaim_control(Duration::ZERO, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].partition, partitions::control("w1"));
        assert_eq!(reclaimed[0].decode::<ControlMessage>().unwrap(), cancel);

        let ids = vec![reclaimed[0].entry_id.clone()];
        assert_eq!(new.ack_control(&partitions::control("w1"), &ids).await.unwrap(), 1);
        assert!(new.reclaim_control(Duration::ZERO, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_control_covers_global_partition() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let update = ControlMessage::ConfigUpdate {
            config: serde_json::json!({"queue_capacity": 5}),
        };
        enqueue_message(queue.as_ref(), partitions::GLOBAL_CONTROL, &update)
            .await
            .unwrap();
        let old = channel(queue.clone(), "w1", "boot-a");
        assert_eq!(old.poll_control(10, None).await.unwrap().len(), 1);

        // 其他Worker各自有消费组，不会认领w1的条目
        let other = channel(queue.clone(), "w2", "boot-a");
        assert!(other.reclaim_control(Duration::ZERO, 10).await.unwrap().is_empty());

        let new = channel(queue.clone(), "w1", "boot-b");
        let reclaimed = new.reclaim_control(Duration::ZERO, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].partition, partitions::GLOBAL_CONTROL);
    }
}
