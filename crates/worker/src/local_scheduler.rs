//! Worker本地调度队列
//!
//! 有界优先级队列：优先级高的先出，同优先级按入队顺序。
//! - 队列满时 `enqueue` 等待空位直到超时，不会覆盖或丢弃其他条目；
//!   同一个执行ID重新入队时旧条目作废，新条目直接替换它。
//! - 老化：每等待满一个老化间隔，有效优先级提高 `aging_step`，最高到
//!   `max_priority`，因此等待 `ceil((max - p) / step)` 个间隔后一定进入最高档。
//! - `remove` 只留下墓碑，出队时跳过。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use taskfleet_core::config::WorkerConfig;
use taskfleet_core::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
pub struct LocalSchedulerConfig {
    pub capacity: usize,
    pub min_priority: i32,
    pub max_priority: i32,
    pub aging_interval: Duration,
    pub aging_step: i32,
}

impl From<&WorkerConfig> for LocalSchedulerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            capacity: config.queue_capacity,
            min_priority: config.min_priority,
            max_priority: config.max_priority,
            aging_interval: Duration::from_secs(config.aging_interval_seconds),
            aging_step: config.aging_step,
        }
    }
}

impl Default for LocalSchedulerConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapKey {
    priority: i32,
    seq: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Slot<T> {
    execution_id: String,
    base_priority: i32,
    priority: i32,
    enqueued_at: Instant,
    item: T,
}

struct Inner<T> {
    heap: BinaryHeap<HeapKey>,
    slots: HashMap<u64, Slot<T>>,
    by_execution: HashMap<String, u64>,
    next_seq: u64,
    config: LocalSchedulerConfig,
}

impl<T> Inner<T> {
    fn insert(&mut self, execution_id: String, priority: i32, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let priority = priority.clamp(self.config.min_priority, self.config.max_priority);
        self.heap.push(HeapKey { priority, seq });
        self.by_execution.insert(execution_id.clone(), seq);
        self.slots.insert(
            seq,
            Slot {
                execution_id,
                base_priority: priority,
                priority,
                enqueued_at: Instant::now(),
                item,
            },
        );
    }

    fn take(&mut self, execution_id: &str) -> Option<T> {
        let seq = self.by_execution.remove(execution_id)?;
        self.slots.remove(&seq).map(|slot| slot.item)
    }

    fn aged_priority(&self, slot: &Slot<T>, now: Instant) -> i32 {
        let interval = self.config.aging_interval.as_millis().max(1);
        let waited = now.saturating_duration_since(slot.enqueued_at).as_millis();
        let steps = i64::try_from(waited / interval).unwrap_or(i64::MAX);
        let boosted = i64::from(slot.base_priority)
            .saturating_add(steps.saturating_mul(i64::from(self.config.aging_step)));
        boosted.min(i64::from(self.config.max_priority)) as i32
    }

    /// 重新计算有效优先级；有变化时重建堆，顺带清掉墓碑
    fn age(&mut self, now: Instant) -> usize {
        let updates: Vec<(u64, i32)> = self
            .slots
            .iter()
            .filter_map(|(seq, slot)| {
                let aged = self.aged_priority(slot, now);
                (aged != slot.priority).then_some((*seq, aged))
            })
            .collect();
        if updates.is_empty() {
            return 0;
        }
        for (seq, priority) in &updates {
            if let Some(slot) = self.slots.get_mut(seq) {
                slot.priority = *priority;
            }
        }
        self.heap = self
            .slots
            .iter()
            .map(|(seq, slot)| HeapKey {
                priority: slot.priority,
                seq: *seq,
            })
            .collect();
        updates.len()
    }

    fn pop(&mut self) -> Option<(String, T)> {
        while let Some(key) = self.heap.pop() {
            match self.slots.get(&key.seq) {
                Some(slot) if slot.priority == key.priority => {
                    let slot = self.slots.remove(&key.seq)?;
                    self.by_execution.remove(&slot.execution_id);
                    return Some((slot.execution_id, slot.item));
                }
                // 墓碑或老化前的旧键
                _ => continue,
            }
        }
        None
    }
}

/// 队列中一个条目的只读视图
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueuedSnapshot {
    pub execution_id: String,
    pub base_priority: i32,
    pub effective_priority: i32,
    pub waited_ms: u64,
}

pub struct LocalScheduler<T> {
    inner: Mutex<Inner<T>>,
    /// 有新条目可出队
    ready: Notify,
    /// 有空位可入队
    space: Notify,
}

impl<T: Send> LocalScheduler<T> {
    pub fn new(config: LocalSchedulerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                slots: HashMap::new(),
                by_execution: HashMap::new(),
                next_seq: 0,
                config,
            }),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// 入队，队列满时最多等待 `timeout`
    ///
    /// 同一执行ID已在队列中时返回被替换掉的旧条目。
    pub async fn enqueue(
        &self,
        execution_id: &str,
        priority: i32,
        item: T,
        timeout: Duration,
    ) -> SchedulerResult<Option<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let space = self.space.notified();
            {
                let mut inner = self.inner.lock().await;
                let replaced = inner.take(execution_id);
                if replaced.is_some() || inner.slots.len() < inner.config.capacity {
                    inner.insert(execution_id.to_string(), priority, item);
                    metrics::gauge!("taskfleet_local_queue_depth").set(inner.slots.len() as f64);
                    drop(inner);
                    self.ready.notify_one();
                    return Ok(replaced);
                }
            }
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                metrics::counter!("taskfleet_admission_timeouts_total").increment(1);
                return Err(SchedulerError::AdmissionTimeout(timeout));
            }
        }
    }

    /// 不等待的入队
    pub async fn try_enqueue(&self, execution_id: &str, priority: i32, item: T) -> SchedulerResult<Option<T>> {
        self.enqueue(execution_id, priority, item, Duration::ZERO).await
    }

    /// 取消排队中的条目
    pub async fn remove(&self, execution_id: &str) -> Option<T> {
        let removed = self.inner.lock().await.take(execution_id);
        if removed.is_some() {
            self.space.notify_waiters();
        }
        removed
    }

    pub async fn try_dequeue(&self) -> Option<(String, T)> {
        let popped = {
            let mut inner = self.inner.lock().await;
            inner.age(Instant::now());
            let popped = inner.pop();
            metrics::gauge!("taskfleet_local_queue_depth").set(inner.slots.len() as f64);
            popped
        };
        if popped.is_some() {
            self.space.notify_waiters();
        }
        popped
    }

    /// 等待直到有条目可出队
    pub async fn dequeue(&self) -> (String, T) {
        loop {
            let ready = self.ready.notified();
            if let Some(entry) = self.try_dequeue().await {
                return entry;
            }
            ready.await;
        }
    }

    /// 调整容量；缩容不会驱逐已有条目，只是阻塞后续入队
    pub async fn set_capacity(&self, capacity: usize) {
        self.inner.lock().await.config.capacity = capacity;
        self.space.notify_waiters();
    }

    pub async fn set_aging(&self, interval: Duration, step: i32) {
        let mut inner = self.inner.lock().await;
        inner.config.aging_interval = interval;
        inner.config.aging_step = step;
    }

    pub async fn aging(&self) -> (Duration, i32) {
        let inner = self.inner.lock().await;
        (inner.config.aging_interval, inner.config.aging_step)
    }

    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.config.capacity
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, execution_id: &str) -> bool {
        self.inner.lock().await.by_execution.contains_key(execution_id)
    }

    /// 立即执行一次老化，返回优先级发生变化的条目数
    pub async fn age_now(&self) -> usize {
        self.inner.lock().await.age(Instant::now())
    }

    /// 按出队顺序列出队列内容
    pub async fn snapshot(&self) -> Vec<QueuedSnapshot> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let mut entries: Vec<(HeapKey, QueuedSnapshot)> = inner
            .slots
            .iter()
            .map(|(seq, slot)| {
                let effective = inner.aged_priority(slot, now);
                (
                    HeapKey {
                        priority: effective,
                        seq: *seq,
                    },
                    QueuedSnapshot {
                        execution_id: slot.execution_id.clone(),
                        base_priority: slot.base_priority,
                        effective_priority: effective,
                        waited_ms: now.saturating_duration_since(slot.enqueued_at).as_millis() as u64,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, s)| s).collect()
    }
}
