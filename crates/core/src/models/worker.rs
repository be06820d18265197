use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::task::ResourceLimits;

/// Worker与控制面之间的连接方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// 直接连接broker
    #[default]
    Direct,
    /// 经由网关代理
    Proxied,
}

/// Worker状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Online,
    /// 不再接收新任务，运行中的任务继续执行
    Draining,
    Offline,
}

/// Worker心跳
///
/// 以较短的TTL写入注册表，TTL内没有刷新即视为离线。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatMessage {
    pub worker_id: String,
    pub boot_id: String,
    pub hostname: String,
    pub status: WorkerStatus,
    pub transport: TransportMode,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub running_tasks: u32,
    pub max_concurrency: u32,
    pub version: String,
    pub os: String,
    /// 能力表，例如 `{"browser": true, "gpu": "a100"}`
    pub capabilities: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    pub timestamp: DateTime<Utc>,
}

/// Worker节点信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerNode {
    pub id: String,
    pub boot_id: String,
    pub hostname: String,
    pub transport: TransportMode,
    pub status: WorkerStatus,
    pub capabilities: BTreeMap<String, serde_json::Value>,
    pub resource_limits: ResourceLimits,
    pub running_tasks: u32,
    pub max_concurrency: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub version: String,
    pub os: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerNode {
    pub fn from_heartbeat(heartbeat: &HeartbeatMessage) -> Self {
        Self {
            id: heartbeat.worker_id.clone(),
            boot_id: heartbeat.boot_id.clone(),
            hostname: heartbeat.hostname.clone(),
            transport: heartbeat.transport,
            status: heartbeat.status,
            capabilities: heartbeat.capabilities.clone(),
            resource_limits: heartbeat.resource_limits.clone(),
            running_tasks: heartbeat.running_tasks,
            max_concurrency: heartbeat.max_concurrency,
            cpu_percent: heartbeat.cpu_percent,
            memory_percent: heartbeat.memory_percent,
            disk_percent: heartbeat.disk_percent,
            version: heartbeat.version.clone(),
            os: heartbeat.os.clone(),
            last_heartbeat: heartbeat.timestamp,
        }
    }

    /// 能力存在且不为 `false`/`null`
    pub fn has_capability(&self, name: &str) -> bool {
        match self.capabilities.get(name) {
            None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.has_capability(c))
    }

    pub fn is_online(&self) -> bool {
        self.status == WorkerStatus::Online
    }

    /// 获取Worker负载率
    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrency == 0 {
            100.0
        } else {
            (self.running_tasks as f64 / self.max_concurrency as f64) * 100.0
        }
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, ttl_seconds: i64, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() > ttl_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> HeartbeatMessage {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("browser".to_string(), serde_json::json!(true));
        capabilities.insert("gpu".to_string(), serde_json::json!(false));
        HeartbeatMessage {
            worker_id: "w1".to_string(),
            boot_id: "b1".to_string(),
            hostname: "host".to_string(),
            status: WorkerStatus::Online,
            transport: TransportMode::Direct,
            cpu_percent: 10.0,
            memory_percent: 20.0,
            disk_percent: 30.0,
            running_tasks: 1,
            max_concurrency: 4,
            version: "1.0.0".to_string(),
            os: "linux".to_string(),
            capabilities,
            resource_limits: ResourceLimits::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_capability_matching_ignores_false_values() {
        let node = WorkerNode::from_heartbeat(&heartbeat());
        assert!(node.has_capability("browser"));
        assert!(!node.has_capability("gpu"));
        assert!(!node.has_capabilities(&["browser".to_string(), "gpu".to_string()]));
        assert!(node.has_capabilities(&[]));
    }

    #[test]
    fn test_load_percentage() {
        let node = WorkerNode::from_heartbeat(&heartbeat());
        assert_eq!(node.load_percentage(), 25.0);
    }
}
