use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 任务定义
///
/// 由用户创建和编辑，调度器只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub schedule: ScheduleSpec,
    pub execution_strategy: ExecutionStrategy,
    /// FIXED_WORKER / PREFER_BOUND 使用的绑定Worker
    pub bound_worker_id: Option<String>,
    /// PREFER_BOUND 在绑定Worker不可用时是否允许回退到自动选择
    pub failover_enabled: bool,
    /// 任务需要的Worker能力（例如 `browser`）
    pub required_capabilities: Vec<String>,
    pub params: serde_json::Value,
    pub priority: i32,
    pub timeout_seconds: u64,
    pub retry_policy: RetryPolicy,
    pub resource_overrides: Option<ResourceLimits>,
    pub allow_overlap: bool,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    Paused,
}

/// 调度规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// 六段式CRON表达式（秒 分 时 日 月 周）
    Cron { expr: String },
    /// 固定间隔
    Interval { seconds: u64 },
    /// 只能手动触发
    Manual,
}

/// 执行解析策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStrategy {
    FixedWorker,
    Specified,
    #[default]
    AutoSelect,
    PreferBound,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStrategy::FixedWorker => "FIXED_WORKER",
            ExecutionStrategy::Specified => "SPECIFIED",
            ExecutionStrategy::AutoSelect => "AUTO_SELECT",
            ExecutionStrategy::PreferBound => "PREFER_BOUND",
        };
        f.write_str(s)
    }
}

/// 任务级重试策略，与传输层重试分开计数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: u64,
    pub retry_on_timeout: bool,
    pub retry_on_resource_limit: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_seconds: 30,
            backoff_multiplier: 2.0,
            max_delay_seconds: 3600,
            retry_on_timeout: true,
            retry_on_resource_limit: false,
        }
    }
}

/// 资源限制；`None` 表示不限制
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ResourceLimits {
    pub cpu_seconds: Option<u64>,
    pub memory_mb: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_output_lines: Option<u64>,
}

impl ResourceLimits {
    /// 用 `overrides` 中设置的字段覆盖当前值
    pub fn merged_with(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_seconds: overrides.cpu_seconds.or(self.cpu_seconds),
            memory_mb: overrides.memory_mb.or(self.memory_mb),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            max_output_lines: overrides.max_output_lines.or(self.max_output_lines),
        }
    }
}

/// 单次运行的覆盖参数（手动触发时由调用方提供）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunOverrides {
    pub execution_id: Option<String>,
    pub strategy: Option<ExecutionStrategy>,
    pub worker_id: Option<String>,
    pub params: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub extra: HashMap<String, serde_json::Value>,
}

impl TaskDefinition {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    /// 运行级覆盖优先于任务定义级，默认 AUTO_SELECT
    pub fn effective_strategy(&self, overrides: Option<&RunOverrides>) -> ExecutionStrategy {
        overrides
            .and_then(|o| o.strategy)
            .unwrap_or(self.execution_strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_override_only_set_fields() {
        let base = ResourceLimits {
            cpu_seconds: Some(60),
            memory_mb: Some(512),
            max_open_files: Some(256),
            max_output_lines: None,
        };
        let overrides = ResourceLimits {
            memory_mb: Some(1024),
            max_output_lines: Some(100),
            ..Default::default()
        };
        let merged = base.merged_with(&overrides);
        assert_eq!(merged.cpu_seconds, Some(60));
        assert_eq!(merged.memory_mb, Some(1024));
        assert_eq!(merged.max_open_files, Some(256));
        assert_eq!(merged.max_output_lines, Some(100));
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&ExecutionStrategy::PreferBound).unwrap();
        assert_eq!(json, "\"PREFER_BOUND\"");
        let parsed: ExecutionStrategy = serde_json::from_str("\"FIXED_WORKER\"").unwrap();
        assert_eq!(parsed, ExecutionStrategy::FixedWorker);
    }
}
