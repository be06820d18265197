use serde::{Deserialize, Serialize};

use super::gateway::AuthMode;
use crate::models::{ResourceLimits, TransportMode};

/// Worker访问网关时使用的凭据
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerAuthConfig {
    pub mode: AuthMode,
    pub api_key: Option<String>,
    pub hmac_secret: Option<String>,
    pub cert_subject: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 为空时使用主机名
    pub worker_id: Option<String>,
    pub transport: TransportMode,
    pub gateway_url: Option<String>,
    pub auth: WorkerAuthConfig,
    pub capabilities: Vec<String>,

    pub max_concurrency: usize,
    pub queue_capacity: usize,
    pub admission_timeout_ms: u64,
    pub min_priority: i32,
    pub max_priority: i32,
    pub aging_interval_seconds: u64,
    pub aging_step: i32,

    pub heartbeat_interval_seconds: u64,
    pub heartbeat_ttl_seconds: u64,
    pub poll_block_ms: u64,
    pub reclaim_interval_seconds: u64,
    pub reclaim_min_idle_seconds: u64,
    pub log_batch_size: usize,
    pub log_flush_interval_ms: u64,

    pub default_timeout_seconds: u64,
    pub default_limits: ResourceLimits,
    pub grace_period_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub env_allowlist: Vec<String>,
    pub scratch_dir: bool,
    pub wrapper: Vec<String>,
    pub artifact_root: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: None,
            transport: TransportMode::Direct,
            gateway_url: None,
            auth: WorkerAuthConfig::default(),
            capabilities: vec![],
            max_concurrency: 4,
            queue_capacity: 100,
            admission_timeout_ms: 5_000,
            min_priority: 0,
            max_priority: 10,
            aging_interval_seconds: 30,
            aging_step: 1,
            heartbeat_interval_seconds: 10,
            heartbeat_ttl_seconds: 30,
            poll_block_ms: 1_000,
            reclaim_interval_seconds: 30,
            reclaim_min_idle_seconds: 120,
            log_batch_size: 100,
            log_flush_interval_ms: 500,
            default_timeout_seconds: 3_600,
            default_limits: ResourceLimits::default(),
            grace_period_seconds: 10,
            shutdown_timeout_seconds: 30,
            env_allowlist: vec!["PATH".to_string(), "HOME".to_string(), "LANG".to_string()],
            scratch_dir: false,
            wrapper: vec![],
            artifact_root: None,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.worker_id {
            if id.is_empty() || id.contains(':') {
                return Err(anyhow::anyhow!("Worker ID不能为空且不能包含冒号: {id:?}"));
            }
        }

        if self.transport == TransportMode::Proxied && self.gateway_url.is_none() {
            return Err(anyhow::anyhow!("经由网关连接时必须配置gateway_url"));
        }

        if self.max_concurrency == 0 {
            return Err(anyhow::anyhow!("最大并发数必须大于0"));
        }

        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!("本地队列容量必须大于0"));
        }

        if self.min_priority > self.max_priority {
            return Err(anyhow::anyhow!(
                "优先级范围无效: {}..={}",
                self.min_priority,
                self.max_priority
            ));
        }

        if self.aging_interval_seconds == 0 || self.aging_step <= 0 {
            return Err(anyhow::anyhow!("老化间隔和老化步长必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.heartbeat_ttl_seconds <= self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!("心跳TTL必须大于心跳间隔"));
        }

        if self.reclaim_min_idle_seconds <= self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!(
                "reclaim空闲阈值必须大于心跳间隔，否则正在执行的条目会被误认领"
            ));
        }

        if self.scratch_dir && self.artifact_root.is_none() {
            return Err(anyhow::anyhow!("使用临时工作目录时必须配置artifact_root"));
        }

        Ok(())
    }
}
