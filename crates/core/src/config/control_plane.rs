use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub lock_key: String,
    pub ttl_seconds: u64,
    /// 为空时使用 `hostname:pid`
    pub node_id: Option<String>,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_key: "taskfleet:leader".to_string(),
            ttl_seconds: 15,
            node_id: None,
        }
    }
}

impl LeaderConfig {
    /// 参与选主时使用的节点ID
    pub fn resolve_node_id(&self, hostname: &str) -> String {
        match self.node_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{hostname}:{}", std::process::id()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lock_key.is_empty() {
            return Err(anyhow::anyhow!("Leader锁的key不能为空"));
        }
        // 续约间隔是ttl/3，至少要有1秒
        if self.ttl_seconds < 3 {
            return Err(anyhow::anyhow!("Leader租约TTL不能小于3秒"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub scan_interval_seconds: u64,
    /// "load_based" 或 "round_robin"
    pub selector: String,
    /// 缓存的Worker心跳超过该时长视为过时，需要主动探测
    pub worker_stale_seconds: u64,
    pub result_batch_size: usize,
    pub result_block_ms: u64,
    pub reconcile_interval_seconds: u64,
    pub dispatch_ack_timeout_seconds: u64,
    pub dispatching_stuck_seconds: u64,
    pub worker_lost_grace_seconds: u64,
    pub retry_scan_interval_seconds: u64,
    pub retry_jitter_factor: f64,
    pub runtime_manage_timeout_seconds: u64,
    /// 启动时载入的任务定义文件（JSON数组）
    pub tasks_file: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_seconds: 1,
            selector: "load_based".to_string(),
            worker_stale_seconds: 20,
            result_batch_size: 100,
            result_block_ms: 1_000,
            reconcile_interval_seconds: 10,
            dispatch_ack_timeout_seconds: 60,
            dispatching_stuck_seconds: 30,
            worker_lost_grace_seconds: 60,
            retry_scan_interval_seconds: 5,
            retry_jitter_factor: 0.1,
            runtime_manage_timeout_seconds: 10,
            tasks_file: None,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scan_interval_seconds == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        let valid_selectors = ["load_based", "round_robin"];
        if !valid_selectors.contains(&self.selector.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的Worker选择策略: {}，支持的策略: {:?}",
                self.selector,
                valid_selectors
            ));
        }

        if self.result_batch_size == 0 {
            return Err(anyhow::anyhow!("结果消费批大小必须大于0"));
        }

        if self.reconcile_interval_seconds == 0 || self.retry_scan_interval_seconds == 0 {
            return Err(anyhow::anyhow!("对账和重试扫描间隔必须大于0"));
        }

        if self.dispatch_ack_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("派发确认超时必须大于0"));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(anyhow::anyhow!("重试抖动系数必须在0到1之间"));
        }

        Ok(())
    }
}
