use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::task::ResourceLimits;
use super::task_run::RuntimeStatus;

/// 沙箱策略
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SandboxPolicy {
    /// 允许从父进程继承的环境变量
    pub env_allowlist: Vec<String>,
    /// 在独立的临时目录中运行
    pub scratch_dir: bool,
    /// 命令包装前缀，例如 `["nsjail", "--"]`
    pub wrapper: Vec<String>,
}

/// 执行计划
///
/// 只包含声明式数据，由插件生成，每次运行重新构建。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub execution_id: String,
    pub plugin: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
    pub sandbox: SandboxPolicy,
    pub artifact_patterns: Vec<String>,
}

/// 执行结束原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    NonZeroExit,
    Timeout,
    Cancelled,
    MemoryLimitExceeded,
    CpuLimitExceeded,
    OutputLimitExceeded,
    SpawnFailed,
    Signaled,
}

impl ExitReason {
    pub fn runtime_status(&self) -> RuntimeStatus {
        match self {
            ExitReason::Completed => RuntimeStatus::Success,
            ExitReason::Timeout => RuntimeStatus::Timeout,
            ExitReason::Cancelled => RuntimeStatus::Cancelled,
            _ => RuntimeStatus::Failed,
        }
    }

    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            ExitReason::MemoryLimitExceeded
                | ExitReason::CpuLimitExceeded
                | ExitReason::OutputLimitExceeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::NonZeroExit => "non_zero_exit",
            ExitReason::Timeout => "timeout",
            ExitReason::Cancelled => "cancelled",
            ExitReason::MemoryLimitExceeded => "memory_limit_exceeded",
            ExitReason::CpuLimitExceeded => "cpu_limit_exceeded",
            ExitReason::OutputLimitExceeded => "output_limit_exceeded",
            ExitReason::SpawnFailed => "spawn_failed",
            ExitReason::Signaled => "signaled",
        }
    }

    /// 上报方没有给出错误信息时使用的默认描述
    pub fn default_message(&self, exit_code: Option<i32>) -> Option<String> {
        match self {
            ExitReason::Completed => None,
            ExitReason::NonZeroExit => Some(format!(
                "进程以非零退出码结束: {}",
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
            )),
            ExitReason::Timeout => Some("执行超时".to_string()),
            ExitReason::Cancelled => Some("执行被取消".to_string()),
            ExitReason::MemoryLimitExceeded => Some("内存使用超出限制".to_string()),
            ExitReason::CpuLimitExceeded => Some("CPU时间超出限制".to_string()),
            ExitReason::OutputLimitExceeded => Some("输出行数超出限制".to_string()),
            ExitReason::SpawnFailed => Some("进程启动失败".to_string()),
            ExitReason::Signaled => Some("进程被信号终止".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ResourceUsage {
    pub max_rss_kb: Option<u64>,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    /// 相对工作目录的路径
    pub path: String,
    pub stored_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub sha256: String,
}

/// 执行结果，每次运行只产生一次
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub exit_reason: ExitReason,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub usage: ResourceUsage,
    pub artifacts: Vec<ArtifactRef>,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    pub fn runtime_status(&self) -> RuntimeStatus {
        self.exit_reason.runtime_status()
    }

    /// 非成功终态总是带有可读的错误信息
    pub fn effective_error_message(&self) -> Option<String> {
        if self.exit_reason == ExitReason::Completed {
            return None;
        }
        self.error_message
            .clone()
            .or_else(|| self.exit_reason.default_message(self.exit_code))
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "exit_reason": self.exit_reason.as_str(),
            "usage": self.usage,
            "artifacts": self.artifacts,
        })
    }
}
