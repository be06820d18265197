//! Worker注册表实现

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use taskfleet_core::models::{HeartbeatMessage, WorkerNode};
use taskfleet_core::traits::WorkerRegistry;
use taskfleet_core::SchedulerResult;

use crate::redis_stream::RedisConnectionManager;

/// 节点信息的保留时长，远长于存活键
const INFO_RETENTION: Duration = Duration::from_secs(24 * 3600);

const WORKER_SET_KEY: &str = "taskfleet:workers";

fn alive_key(worker_id: &str) -> String {
    format!("taskfleet:worker:alive:{worker_id}")
}

fn info_key(worker_id: &str) -> String {
    format!("taskfleet:worker:info:{worker_id}")
}

#[derive(Debug, Clone)]
struct Registration {
    node: WorkerNode,
    alive_until: Instant,
}

/// 进程内注册表
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkerRegistry {
    workers: Arc<RwLock<HashMap<String, Registration>>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入节点信息，不刷新存活键
    pub async fn upsert_stale(&self, node: WorkerNode) {
        self.workers.write().await.insert(
            node.id.clone(),
            Registration {
                node,
                alive_until: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn record_heartbeat(&self, heartbeat: &HeartbeatMessage, ttl: Duration) -> SchedulerResult<()> {
        let node = WorkerNode::from_heartbeat(heartbeat);
        self.workers.write().await.insert(
            node.id.clone(),
            Registration {
                node,
                alive_until: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<WorkerNode>> {
        Ok(self.workers.read().await.get(worker_id).map(|r| r.node.clone()))
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<WorkerNode>> {
        let mut nodes: Vec<WorkerNode> = self
            .workers
            .read()
            .await
            .values()
            .map(|r| r.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn probe(&self, worker_id: &str) -> SchedulerResult<bool> {
        let now = Instant::now();
        Ok(self
            .workers
            .read()
            .await
            .get(worker_id)
            .is_some_and(|r| r.alive_until > now))
    }

    async fn remove_worker(&self, worker_id: &str) -> SchedulerResult<()> {
        self.workers.write().await.remove(worker_id);
        Ok(())
    }
}

/// 基于Redis的注册表
///
/// - `taskfleet:worker:alive:{id}` 存活键，TTL为心跳TTL
/// - `taskfleet:worker:info:{id}` 节点信息JSON
/// - `taskfleet:workers` 所有注册过的Worker ID集合
pub struct RedisWorkerRegistry {
    connection_manager: Arc<RedisConnectionManager>,
}

impl RedisWorkerRegistry {
    pub fn new(connection_manager: Arc<RedisConnectionManager>) -> Self {
        Self { connection_manager }
    }
}

#[async_trait]
impl WorkerRegistry for RedisWorkerRegistry {
    async fn record_heartbeat(&self, heartbeat: &HeartbeatMessage, ttl: Duration) -> SchedulerResult<()> {
        let node = WorkerNode::from_heartbeat(heartbeat);
        let info = serde_json::to_string(&node)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(alive_key(&node.id))
            .arg(&heartbeat.boot_id)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .ignore()
            .cmd("SET")
            .arg(info_key(&node.id))
            .arg(info)
            .arg("PX")
            .arg(INFO_RETENTION.as_millis() as u64)
            .ignore()
            .cmd("SADD")
            .arg(WORKER_SET_KEY)
            .arg(&node.id)
            .ignore();
        self.connection_manager.execute_pipeline("record_heartbeat", &pipe).await?;
        debug!("记录Worker {} 心跳", node.id);
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<WorkerNode>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(info_key(worker_id));
        let raw: Option<String> = self.connection_manager.execute("get_worker", &cmd).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<WorkerNode>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(WORKER_SET_KEY);
        let mut ids: Vec<String> = self.connection_manager.execute("list_workers", &cmd).await?;
        ids.sort();

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_worker(&id).await? {
                Some(node) => nodes.push(node),
                None => {
                    // 节点信息已过期，清理集合
                    let mut srem = redis::cmd("SREM");
                    srem.arg(WORKER_SET_KEY).arg(&id);
                    let _: i64 = self.connection_manager.execute("srem_worker", &srem).await?;
                }
            }
        }
        Ok(nodes)
    }

    async fn probe(&self, worker_id: &str) -> SchedulerResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(alive_key(worker_id));
        let exists: i64 = self.connection_manager.execute("probe_worker", &cmd).await?;
        Ok(exists == 1)
    }

    async fn remove_worker(&self, worker_id: &str) -> SchedulerResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(alive_key(worker_id))
            .arg(info_key(worker_id))
            .ignore()
            .cmd("SREM")
            .arg(WORKER_SET_KEY)
            .arg(worker_id)
            .ignore();
        self.connection_manager.execute_pipeline("remove_worker", &pipe).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use taskfleet_core::models::{TransportMode, WorkerStatus};

    fn heartbeat(worker_id: &str) -> HeartbeatMessage {
        HeartbeatMessage {
            worker_id: worker_id.to_string(),
            boot_id: "boot-1".to_string(),
            hostname: "host".to_string(),
            status: WorkerStatus::Online,
            transport: TransportMode::Direct,
            cpu_percent: 10.0,
            memory_percent: 20.0,
            disk_percent: 30.0,
            running_tasks: 1,
            max_concurrency: 4,
            version: "0.1.0".to_string(),
            os: "linux".to_string(),
            capabilities: BTreeMap::new(),
            resource_limits: Default::default(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_follows_heartbeat_ttl() {
        let registry = InMemoryWorkerRegistry::new();
        let ttl = Duration::from_secs(30);
        registry.record_heartbeat(&heartbeat("w1"), ttl).await.unwrap();
        assert!(registry.probe("w1").await.unwrap());

        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        assert!(!registry.probe("w1").await.unwrap());
        // 节点信息仍可读取
        assert!(registry.get_worker("w1").await.unwrap().is_some());

        registry.record_heartbeat(&heartbeat("w1"), ttl).await.unwrap();
        assert!(registry.probe("w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let registry = InMemoryWorkerRegistry::new();
        let ttl = Duration::from_secs(30);
        registry.record_heartbeat(&heartbeat("w2"), ttl).await.unwrap();
        registry.record_heartbeat(&heartbeat("w1"), ttl).await.unwrap();

        let ids: Vec<String> = registry
            .list_workers()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["w1", "w2"]);

        registry.remove_worker("w1").await.unwrap();
        assert!(registry.get_worker("w1").await.unwrap().is_none());
        assert!(!registry.probe("w1").await.unwrap());
        assert!(registry.probe("w2").await.unwrap());
    }
}
