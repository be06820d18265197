use metrics::{counter, histogram};
use std::sync::atomic::{AtomicU64, Ordering};

/// Redis Stream操作计数
///
/// 原子计数供健康检查读取，同时写入 `metrics` 门面。
#[derive(Debug, Default)]
pub struct RedisStreamMetrics {
    pub entries_enqueued: AtomicU64,
    pub entries_delivered: AtomicU64,
    pub entries_acked: AtomicU64,
    pub entries_reclaimed: AtomicU64,
    pub connection_errors: AtomicU64,
}

impl RedisStreamMetrics {
    pub fn record_enqueued(&self) {
        self.entries_enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("taskfleet_queue_enqueued_total").increment(1);
    }

    pub fn record_delivered(&self, n: usize) {
        self.entries_delivered.fetch_add(n as u64, Ordering::Relaxed);
        counter!("taskfleet_queue_delivered_total").increment(n as u64);
    }

    pub fn record_acked(&self, n: usize) {
        self.entries_acked.fetch_add(n as u64, Ordering::Relaxed);
        counter!("taskfleet_queue_acked_total").increment(n as u64);
    }

    pub fn record_reclaimed(&self, n: usize) {
        self.entries_reclaimed.fetch_add(n as u64, Ordering::Relaxed);
        counter!("taskfleet_queue_reclaimed_total").increment(n as u64);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        counter!("taskfleet_redis_connection_errors_total").increment(1);
    }

    /// 记录操作耗时
    pub fn record_operation_duration(&self, operation: &str, duration_ms: f64) {
        histogram!("taskfleet_redis_operation_duration_ms", "operation" => operation.to_string())
            .record(duration_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_enqueued: self.entries_enqueued.load(Ordering::Relaxed),
            entries_delivered: self.entries_delivered.load(Ordering::Relaxed),
            entries_acked: self.entries_acked.load(Ordering::Relaxed),
            entries_reclaimed: self.entries_reclaimed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_enqueued: u64,
    pub entries_delivered: u64,
    pub entries_acked: u64,
    pub entries_reclaimed: u64,
    pub connection_errors: u64,
}
