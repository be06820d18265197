use chrono::{TimeZone, Utc};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use taskfleet_core::models::{PendingEntry, QueueEntry};
use taskfleet_core::{SchedulerError, SchedulerResult};

use super::connection_manager::RedisConnectionManager;

/// 条目中保存JSON负载的字段名
pub const PAYLOAD_FIELD: &str = "payload";

/// Redis Streams命令封装
pub struct RedisStreamOperations {
    connection_manager: Arc<RedisConnectionManager>,
    /// 已确认存在的 (stream, group)
    known_groups: Mutex<HashSet<(String, String)>>,
    claim_cursors: Mutex<ClaimCursors>,
}

/// 每个 (stream, group) 的XAUTOCLAIM扫描位置
///
/// 一次认领只扫描 `COUNT` 条，下次从服务端返回的游标继续；游标回到
/// `0-0` 表示已扫完一轮。
#[derive(Debug, Default)]
struct ClaimCursors {
    cursors: HashMap<(String, String), String>,
}

impl ClaimCursors {
    const START: &'static str = "0-0";

    fn start(&self, stream: &str, group: &str) -> String {
        self.cursors
            .get(&(stream.to_string(), group.to_string()))
            .cloned()
            .unwrap_or_else(|| Self::START.to_string())
    }

    fn advance(&mut self, stream: &str, group: &str, next: &str) {
        let key = (stream.to_string(), group.to_string());
        if next.is_empty() || next == Self::START {
            self.cursors.remove(&key);
        } else {
            self.cursors.insert(key, next.to_string());
        }
    }

    fn forget(&mut self, stream: &str, group: &str) {
        self.cursors.remove(&(stream.to_string(), group.to_string()));
    }
}

impl RedisStreamOperations {
    pub fn new(connection_manager: Arc<RedisConnectionManager>) -> Self {
        Self {
            connection_manager,
            known_groups: Mutex::new(HashSet::new()),
            claim_cursors: Mutex::new(ClaimCursors::default()),
        }
    }

    pub async fn xadd(&self, stream: &str, payload: &serde_json::Value) -> SchedulerResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*").arg(PAYLOAD_FIELD).arg(payload.to_string());
        self.connection_manager.execute("xadd", &cmd).await
    }

    /// 消费组不存在时创建（从流的起点开始读取）
    pub async fn ensure_consumer_group(&self, stream: &str, group: &str) -> SchedulerResult<()> {
        let key = (stream.to_string(), group.to_string());
        if self.known_groups.lock().await.contains(&key) {
            return Ok(());
        }

        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");
        match self.connection_manager.execute::<String>("xgroup_create", &cmd).await {
            Ok(_) => debug!("创建消费组 {} (stream: {})", group, stream),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("消费组 {} 已存在", group);
            }
            Err(e) => return Err(e),
        }
        self.known_groups.lock().await.insert(key);
        Ok(())
    }

    /// 流被删除或过期后消费组也随之消失，需要重新创建
    pub async fn forget_group(&self, stream: &str, group: &str) {
        self.known_groups
            .lock()
            .await
            .remove(&(stream.to_string(), group.to_string()));
        self.claim_cursors.lock().await.forget(stream, group);
    }

    /// 非阻塞读取新条目
    pub async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">");
        let reply: Option<StreamReadReply> = self.connection_manager.execute("xreadgroup", &cmd).await?;
        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|k| k.ids)
                    .filter_map(|id| to_queue_entry(stream, id, 1))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn xack(&self, stream: &str, group: &str, entry_ids: &[String]) -> SchedulerResult<usize> {
        if entry_ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in entry_ids {
            cmd.arg(id);
        }
        let acked: i64 = self.connection_manager.execute("xack", &cmd).await?;
        Ok(acked.max(0) as usize)
    }

    /// XAUTOCLAIM，被认领的条目投递计数加一
    ///
    /// 从上次返回的游标继续扫描，待确认列表很长时也能逐轮覆盖到全部条目。
    pub async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        let start = self.claim_cursors.lock().await.start(stream, group);
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(&start)
            .arg("COUNT")
            .arg(count);
        let reply: StreamAutoClaimReply = self.connection_manager.execute("xautoclaim", &cmd).await?;
        self.claim_cursors
            .lock()
            .await
            .advance(stream, group, &reply.next_stream_id);
        if !reply.deleted_ids.is_empty() {
            warn!(
                "分区 {} 中有 {} 个待确认条目已被删除，从待确认列表移除",
                stream,
                reply.deleted_ids.len()
            );
        }

        let mut entries = Vec::with_capacity(reply.claimed.len());
        for id in reply.claimed {
            let delivery_count = self.delivery_count(stream, group, &id.id).await.unwrap_or(2);
            if let Some(entry) = to_queue_entry(stream, id, delivery_count) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// 用 XCLAIM（min-idle 为 0）重置仍属于 `consumer` 的条目的空闲时间
    pub async fn xclaim_renew(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        entry_ids: &[String],
    ) -> SchedulerResult<usize> {
        if entry_ids.is_empty() {
            return Ok(0);
        }
        // 只续约仍由自己持有的条目，否则会从其他消费者手中抢走
        let owned: HashSet<String> = self
            .xpending(stream, group)
            .await?
            .into_iter()
            .filter(|p| p.consumer == consumer)
            .map(|p| p.entry_id)
            .collect();
        let ids: Vec<&String> = entry_ids.iter().filter(|id| owned.contains(*id)).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(0);
        for id in &ids {
            cmd.arg(*id);
        }
        cmd.arg("JUSTID");
        let renewed: Vec<String> = self.connection_manager.execute("xclaim", &cmd).await?;
        Ok(renewed.len())
    }

    pub async fn xpending(&self, stream: &str, group: &str) -> SchedulerResult<Vec<PendingEntry>> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group).arg("-").arg("+").arg(10_000);
        let reply: StreamPendingCountReply = self.connection_manager.execute("xpending", &cmd).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                entry_id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                delivery_count: p.times_delivered as u32,
            })
            .collect())
    }

    async fn delivery_count(&self, stream: &str, group: &str, entry_id: &str) -> SchedulerResult<u32> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group).arg(entry_id).arg(entry_id).arg(1);
        let reply: StreamPendingCountReply = self.connection_manager.execute("xpending", &cmd).await?;
        reply
            .ids
            .first()
            .map(|p| p.times_delivered as u32)
            .ok_or_else(|| SchedulerError::Internal(format!("条目 {entry_id} 不在待确认列表中")))
    }

    pub async fn xlen(&self, stream: &str) -> SchedulerResult<usize> {
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(stream);
        let len: u64 = self.connection_manager.execute("xlen", &cmd).await?;
        Ok(len as usize)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> SchedulerResult<()> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl.as_millis() as u64);
        let _: i64 = self.connection_manager.execute("pexpire", &cmd).await?;
        Ok(())
    }
}

/// 条目ID形如 `{毫秒}-{序号}`，入队时间取自ID
fn to_queue_entry(stream: &str, id: StreamId, delivery_count: u32) -> Option<QueueEntry> {
    let raw: String = match id.get(PAYLOAD_FIELD) {
        Some(raw) => raw,
        None => {
            warn!("分区 {} 的条目 {} 缺少负载字段，跳过", stream, id.id);
            return None;
        }
    };
    let payload = match serde_json::from_str(&raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("分区 {} 的条目 {} 负载不是合法JSON: {}", stream, id.id, e);
            serde_json::Value::String(raw)
        }
    };
    let millis = id
        .id
        .split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .unwrap_or_default();
    Some(QueueEntry {
        entry_id: id.id,
        partition: stream.to_string(),
        payload,
        delivery_count,
        enqueued_at: Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_cursor_resumes_and_wraps() {
        let mut cursors = ClaimCursors::default();
        assert_eq!(cursors.start("p0", "g"), "0-0");

        cursors.advance("p0", "g", "1700000000000-5");
        assert_eq!(cursors.start("p0", "g"), "1700000000000-5");
        assert_eq!(cursors.start("p0", "other"), "0-0");
        assert_eq!(cursors.start("p1", "g"), "0-0");

        cursors.advance("p0", "g", "0-0");
        assert_eq!(cursors.start("p0", "g"), "0-0");
    }

    #[test]
    fn test_forgotten_group_restarts_from_beginning() {
        let mut cursors = ClaimCursors::default();
        cursors.advance("p0", "g", "12-0");
        cursors.forget("p0", "g");
        assert_eq!(cursors.start("p0", "g"), "0-0");
    }
}
