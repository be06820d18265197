use std::time::Duration;

use thiserror::Error;

/// 调度平台错误类型定义
///
/// 分类与传播策略：
/// - `Transport`：可重试，由调用方按指数退避在本地重试
/// - `Execution` / `Timeout` / `ResourceLimitExceeded`：任务级失败，通过
///   `runtime_status=failed|timeout` 上报，由调度器自己的重试策略决定是否重跑
/// - `PluginValidation`：在启动任何进程之前失败
/// - `WorkerUnavailable` / `NoEligibleWorker`：是否回退取决于执行策略
/// - `LeadershipLost` / `StaleFencingToken`：中止当前 Leader 专属工作，不终止进程
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("传输错误: {0}")]
    Transport(String),

    #[error("任务执行错误: {0}")]
    Execution(String),

    #[error("任务执行超时: {0:?}")]
    ExecutionTimeout(Duration),

    #[error("资源超限: {resource} ({detail})")]
    ResourceLimitExceeded { resource: String, detail: String },

    #[error("插件校验失败: {}", .0.join("; "))]
    PluginValidation(Vec<String>),

    #[error("没有插件可以处理该任务: {0}")]
    NoPluginMatched(String),

    #[error("Worker不可用: {worker_id} ({reason})")]
    WorkerUnavailable { worker_id: String, reason: String },

    #[error("没有满足条件的Worker: {0}")]
    NoEligibleWorker(String),

    #[error("失去领导权")]
    LeadershipLost,

    #[error("过期的fencing token: {presented} < {current}")]
    StaleFencingToken { presented: u64, current: u64 },

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("本地队列已满，等待 {0:?} 后仍无法入队")]
    AdmissionTimeout(Duration),

    #[error("认证失败: {0}")]
    Unauthorized(String),

    #[error("请求被限流，{retry_after_seconds}秒后重试")]
    RateLimited { retry_after_seconds: u64 },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("任务运行实例未找到: {execution_id}")]
    TaskRunNotFound { execution_id: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 传输层错误可在本地退避重试，其余错误交给上层策略处理
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Transport(_) | SchedulerError::RateLimited { .. })
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        SchedulerError::Transport(msg.into())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
