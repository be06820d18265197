use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use taskfleet_core::models::{PendingEntry, QueueEntry};
use taskfleet_core::traits::TaskQueue;
use taskfleet_core::SchedulerResult;

/// 内存流队列
///
/// 按Redis Streams的消费组语义实现，适用于单进程部署和测试：
/// 每个消费组记录最后投递位置和待确认列表，条目在所有消费组都
/// 确认之后才会被删除。
#[derive(Debug, Clone, Default)]
pub struct InMemoryStreamQueue {
    streams: Arc<Mutex<HashMap<String, Stream>>>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, StoredEntry>,
    next_seq: u64,
    groups: HashMap<String, Group>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    id: String,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Claim>,
}

#[derive(Debug, Clone)]
struct Claim {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

fn parse_seq(entry_id: &str) -> Option<u64> {
    entry_id.rsplit('-').next()?.parse().ok()
}

impl Stream {
    fn to_entry(&self, partition: &str, seq: u64, delivery_count: u32) -> Option<QueueEntry> {
        self.entries.get(&seq).map(|stored| QueueEntry {
            entry_id: stored.id.clone(),
            partition: partition.to_string(),
            payload: stored.payload.clone(),
            delivery_count,
            enqueued_at: stored.enqueued_at,
        })
    }

    /// 删除所有消费组都已读过并确认的条目
    fn collect_garbage(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        let low_water = self
            .groups
            .values()
            .map(|g| {
                let oldest_pending = g.pending.keys().next().copied().unwrap_or(u64::MAX);
                oldest_pending.min(g.last_delivered + 1)
            })
            .min()
            .unwrap_or(0);
        self.entries = self.entries.split_off(&low_water);
    }
}

impl InMemoryStreamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(streams: &mut HashMap<String, Stream>) {
        let now = Instant::now();
        streams.retain(|_, s| s.expires_at.map_or(true, |at| at > now));
    }

    fn try_consume(
        streams: &mut HashMap<String, Stream>,
        partition: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<QueueEntry> {
        let stream = streams.entry(partition.to_string()).or_default();
        let now = Instant::now();
        let group_state = stream.groups.entry(group.to_string()).or_default();
        let seqs: Vec<u64> = stream
            .entries
            .range(group_state.last_delivered + 1..)
            .take(count)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &seqs {
            group_state.last_delivered = *seq;
            group_state.pending.insert(
                *seq,
                Claim {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        seqs.iter()
            .filter_map(|seq| stream.to_entry(partition, *seq, 1))
            .collect()
    }
}

#[async_trait]
impl TaskQueue for InMemoryStreamQueue {
    async fn enqueue(&self, partition: &str, payload: &serde_json::Value) -> SchedulerResult<String> {
        let mut streams = self.streams.lock().await;
        Self::purge_expired(&mut streams);
        let stream = streams.entry(partition.to_string()).or_default();
        stream.next_seq += 1;
        let seq = stream.next_seq;
        let now = Utc::now();
        let id = format!("{}-{}", now.timestamp_millis(), seq);
        stream.entries.insert(
            seq,
            StoredEntry {
                id: id.clone(),
                payload: payload.clone(),
                enqueued_at: now,
            },
        );
        drop(streams);

        counter!("taskfleet_queue_enqueued_total").increment(1);
        self.notify.notify_waiters();
        debug!("条目 {} 写入分区 {}", id, partition);
        Ok(id)
    }

    async fn consume(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            // 先登记通知，避免检查与等待之间漏掉新条目
            let notified = self.notify.notified();
            {
                let mut streams = self.streams.lock().await;
                Self::purge_expired(&mut streams);
                let entries = Self::try_consume(&mut streams, partition, group, consumer, count);
                if !entries.is_empty() {
                    counter!("taskfleet_queue_delivered_total").increment(entries.len() as u64);
                    return Ok(entries);
                }
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(vec![]);
                    }
                }
                _ => return Ok(vec![]),
            }
        }
    }

    async fn ack(&self, partition: &str, group: &str, entry_ids: &[String]) -> SchedulerResult<usize> {
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(partition) else {
            return Ok(0);
        };
        let Some(group_state) = stream.groups.get_mut(group) else {
            return Ok(0);
        };
        let acked = entry_ids
            .iter()
            .filter_map(|id| parse_seq(id))
            .filter(|seq| group_state.pending.remove(seq).is_some())
            .count();
        stream.collect_garbage();
        counter!("taskfleet_queue_acked_total").increment(acked as u64);
        Ok(acked)
    }

    async fn reclaim(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        let mut streams = self.streams.lock().await;
        Self::purge_expired(&mut streams);
        let Some(stream) = streams.get_mut(partition) else {
            return Ok(vec![]);
        };
        let now = Instant::now();
        let Some(group_state) = stream.groups.get_mut(group) else {
            return Ok(vec![]);
        };

        let mut claimed = Vec::new();
        let mut vanished = Vec::new();
        for (seq, claim) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(claim.delivered_at) < min_idle {
                continue;
            }
            if !stream.entries.contains_key(seq) {
                vanished.push(*seq);
                continue;
            }
            claim.consumer = consumer.to_string();
            claim.delivered_at = now;
            claim.delivery_count += 1;
            claimed.push((*seq, claim.delivery_count));
        }
        for seq in vanished {
            group_state.pending.remove(&seq);
        }

        let entries: Vec<QueueEntry> = claimed
            .into_iter()
            .filter_map(|(seq, delivery_count)| stream.to_entry(partition, seq, delivery_count))
            .collect();
        if !entries.is_empty() {
            counter!("taskfleet_queue_reclaimed_total").increment(entries.len() as u64);
            debug!(
                "消费者 {} 从分区 {} 认领了 {} 个空闲条目",
                consumer,
                partition,
                entries.len()
            );
        }
        Ok(entries)
    }

    async fn renew(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        entry_ids: &[String],
    ) -> SchedulerResult<usize> {
        let mut streams = self.streams.lock().await;
        let Some(group_state) = streams
            .get_mut(partition)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let now = Instant::now();
        let mut renewed = 0;
        for seq in entry_ids.iter().filter_map(|id| parse_seq(id)) {
            if let Some(claim) = group_state.pending.get_mut(&seq) {
                if claim.consumer == consumer {
                    claim.delivered_at = now;
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }

    async fn pending(&self, partition: &str, group: &str) -> SchedulerResult<Vec<PendingEntry>> {
        let streams = self.streams.lock().await;
        let Some(stream) = streams.get(partition) else {
            return Ok(vec![]);
        };
        let Some(group_state) = stream.groups.get(group) else {
            return Ok(vec![]);
        };
        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .map(|(seq, claim)| PendingEntry {
                entry_id: stream
                    .entries
                    .get(seq)
                    .map(|e| e.id.clone())
                    .unwrap_or_else(|| format!("0-{seq}")),
                consumer: claim.consumer.clone(),
                idle_ms: now.duration_since(claim.delivered_at).as_millis() as u64,
                delivery_count: claim.delivery_count,
            })
            .collect())
    }

    async fn len(&self, partition: &str) -> SchedulerResult<usize> {
        let mut streams = self.streams.lock().await;
        Self::purge_expired(&mut streams);
        Ok(streams.get(partition).map(|s| s.entries.len()).unwrap_or(0))
    }

    async fn expire(&self, partition: &str, ttl: Duration) -> SchedulerResult<()> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get_mut(partition) {
            stream.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const P: &str = "tasks:w1";
    const G: &str = "workers";

    #[tokio::test]
    async fn test_delivers_in_enqueue_order() {
        let queue = InMemoryStreamQueue::new();
        for i in 0..3 {
            queue.enqueue(P, &json!({"n": i})).await.unwrap();
        }
        let entries = queue.consume(P, G, "c1", 10, None).await.unwrap();
        let ns: Vec<i64> = entries.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2]);
        assert!(entries.iter().all(|e| e.delivery_count == 1));

        // 已投递的条目不会再次被consume读到
        assert!(queue.consume(P, G, "c2", 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_stays_pending_until_acked() {
        let queue = InMemoryStreamQueue::new();
        let id = queue.enqueue(P, &json!({})).await.unwrap();
        queue.consume(P, G, "c1", 1, None).await.unwrap();

        let pending = queue.pending(P, G).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");

        assert_eq!(queue.ack(P, G, &[id.clone()]).await.unwrap(), 1);
        assert_eq!(queue.ack(P, G, &[id]).await.unwrap(), 0);
        assert!(queue.pending(P, G).await.unwrap().is_empty());
        assert_eq!(queue.len(P).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_is_reclaimed_by_live_consumer() {
        let queue = InMemoryStreamQueue::new();
        let id = queue.enqueue(P, &json!({"execution_id": "e1"})).await.unwrap();
        queue.consume(P, G, "dead", 1, None).await.unwrap();

        let early = queue.reclaim(P, G, "live", Duration::from_secs(60), 10).await.unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let claimed = queue.reclaim(P, G, "live", Duration::from_secs(60), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].entry_id, id);
        assert_eq!(claimed[0].delivery_count, 2);

        let pending = queue.pending(P, G).await.unwrap();
        assert_eq!(pending[0].consumer, "live");
        assert_eq!(queue.ack(P, G, &[id]).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_keeps_entry_from_being_reclaimed() {
        let queue = InMemoryStreamQueue::new();
        let id = queue.enqueue(P, &json!({})).await.unwrap();
        queue.consume(P, G, "c1", 1, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(queue.renew(P, G, "c1", &[id.clone()]).await.unwrap(), 1);
        // 其他消费者不能续约不属于自己的条目
        assert_eq!(queue.renew(P, G, "c2", &[id]).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        let claimed = queue.reclaim(P, G, "c2", Duration::from_secs(60), 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_groups_fan_out_independently() {
        let queue = InMemoryStreamQueue::new();
        let id = queue.enqueue("control:global", &json!({"control_type": "config_update"})).await.unwrap();

        let a = queue.consume("control:global", "control:w1", "w1:b", 10, None).await.unwrap();
        let b = queue.consume("control:global", "control:w2", "w2:b", 10, None).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);

        queue.ack("control:global", "control:w1", &[id.clone()]).await.unwrap();
        assert_eq!(queue.len("control:global").await.unwrap(), 1);
        queue.ack("control:global", "control:w2", &[id]).await.unwrap();
        assert_eq!(queue.len("control:global").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocking_consume_wakes_on_enqueue() {
        let queue = InMemoryStreamQueue::new();
        let reader = queue.clone();
        let handle = tokio::spawn(async move {
            reader
                .consume(P, G, "c1", 1, Some(Duration::from_secs(5)))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(P, &json!({"late": true})).await.unwrap();
        let entries = handle.await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_consume_times_out_empty() {
        let queue = InMemoryStreamQueue::new();
        let entries = queue
            .consume(P, G, "c1", 1, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_partition_disappears() {
        let queue = InMemoryStreamQueue::new();
        queue.enqueue("reply:r1", &json!({"ok": true})).await.unwrap();
        queue.expire("reply:r1", Duration::from_secs(10)).await.unwrap();
        assert_eq!(queue.len("reply:r1").await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.len("reply:r1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_entry_is_lost_across_reclaims() {
        let queue = InMemoryStreamQueue::new();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(queue.enqueue(P, &json!({"n": i})).await.unwrap());
        }
        // 第一个消费者拿走一半后失联
        queue.consume(P, G, "dead", 5, None).await.unwrap();
        let rest = queue.consume(P, G, "live", 10, None).await.unwrap();
        let rest_ids: Vec<String> = rest.iter().map(|e| e.entry_id.clone()).collect();
        queue.ack(P, G, &rest_ids).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let reclaimed = queue.reclaim(P, G, "live", Duration::from_secs(60), 100).await.unwrap();
        let reclaimed_ids: Vec<String> = reclaimed.iter().map(|e| e.entry_id.clone()).collect();
        let acked = queue.ack(P, G, &reclaimed_ids).await.unwrap();

        assert_eq!(rest_ids.len() + acked, ids.len());
        assert!(queue.pending(P, G).await.unwrap().is_empty());
    }
}
