use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{ExecutionStrategy, TaskDefinition};

/// 状态更新的来源
///
/// 不同来源的时钟不可比较，过期判断只在同一来源的上报之间进行。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    #[default]
    Worker,
    Dispatcher,
}

/// 派发状态：任务是否成功交给了Worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Dispatching,
    Dispatched,
    Acked,
    Rejected,
    Timeout,
    Failed,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Acked
                | DispatchStatus::Rejected
                | DispatchStatus::Timeout
                | DispatchStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: DispatchStatus) -> bool {
        use DispatchStatus::*;
        matches!(
            (self, next),
            (Pending, Dispatching)
                | (Pending, Failed)
                | (Dispatching, Dispatched)
                | (Dispatching, Failed)
                | (Dispatched, Acked)
                | (Dispatched, Rejected)
                | (Dispatched, Timeout)
                | (Dispatched, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Dispatching => "dispatching",
            DispatchStatus::Dispatched => "dispatched",
            DispatchStatus::Acked => "acked",
            DispatchStatus::Rejected => "rejected",
            DispatchStatus::Timeout => "timeout",
            DispatchStatus::Failed => "failed",
        }
    }
}

/// 运行状态：Worker执行的结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
    Skipped,
}

impl RuntimeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RuntimeStatus::Queued | RuntimeStatus::Running)
    }

    pub fn can_transition_to(&self, next: RuntimeStatus) -> bool {
        use RuntimeStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Skipped)
                | (Queued, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::Queued => "queued",
            RuntimeStatus::Running => "running",
            RuntimeStatus::Success => "success",
            RuntimeStatus::Failed => "failed",
            RuntimeStatus::Cancelled => "cancelled",
            RuntimeStatus::Timeout => "timeout",
            RuntimeStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务运行实例
///
/// `execution_id` 是全局唯一的幂等键。两条状态轨道只能通过
/// [`crate::status_machine::apply_update`] 修改，进入终态后不再变化。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRun {
    pub execution_id: String,
    pub task_id: i64,
    pub project_id: i64,
    pub worker_id: Option<String>,
    pub entry_id: Option<String>,
    pub strategy: ExecutionStrategy,
    pub priority: i32,
    pub params: serde_json::Value,
    pub timeout_seconds: u64,
    pub dispatch_status: DispatchStatus,
    pub runtime_status: RuntimeStatus,
    /// 每条轨道最后一次被接受的上报时间（毫秒）
    pub dispatch_reported_at: i64,
    pub runtime_reported_at: i64,
    /// 每条轨道最后一次被接受的上报来源
    #[serde(default)]
    pub dispatch_reported_by: Option<UpdateOrigin>,
    #[serde(default)]
    pub runtime_reported_by: Option<UpdateOrigin>,
    pub attempt: u32,
    pub retry_of: Option<String>,
    /// 已经为该实例创建的重试实例
    pub retried_by: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
    pub scheduled_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn new(execution_id: impl Into<String>, task: &TaskDefinition, scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            task_id: task.id,
            project_id: task.project_id,
            worker_id: None,
            entry_id: None,
            strategy: task.execution_strategy,
            priority: task.priority,
            params: task.params.clone(),
            timeout_seconds: task.timeout_seconds,
            dispatch_status: DispatchStatus::Pending,
            runtime_status: RuntimeStatus::Queued,
            dispatch_reported_at: 0,
            runtime_reported_at: 0,
            dispatch_reported_by: None,
            runtime_reported_by: None,
            attempt: 1,
            retry_of: None,
            retried_by: None,
            exit_code: None,
            error_message: None,
            result: None,
            duration_ms: None,
            scheduled_at,
            dispatched_at: None,
            acked_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
        }
    }

    /// 运行是否已经结束（运行轨道终态，或派发失败导致永远不会执行）
    pub fn is_finished(&self) -> bool {
        self.runtime_status.is_terminal()
            || matches!(
                self.dispatch_status,
                DispatchStatus::Failed | DispatchStatus::Rejected
            )
    }

    pub fn is_successful(&self) -> bool {
        self.runtime_status == RuntimeStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_edges() {
        assert!(DispatchStatus::Pending.can_transition_to(DispatchStatus::Dispatching));
        assert!(DispatchStatus::Dispatched.can_transition_to(DispatchStatus::Timeout));
        assert!(!DispatchStatus::Pending.can_transition_to(DispatchStatus::Acked));
        assert!(!DispatchStatus::Acked.can_transition_to(DispatchStatus::Dispatched));
        assert!(!DispatchStatus::Dispatched.can_transition_to(DispatchStatus::Dispatching));
    }

    #[test]
    fn test_runtime_edges() {
        assert!(RuntimeStatus::Queued.can_transition_to(RuntimeStatus::Running));
        assert!(RuntimeStatus::Queued.can_transition_to(RuntimeStatus::Cancelled));
        assert!(RuntimeStatus::Running.can_transition_to(RuntimeStatus::Timeout));
        assert!(!RuntimeStatus::Queued.can_transition_to(RuntimeStatus::Success));
        assert!(!RuntimeStatus::Running.can_transition_to(RuntimeStatus::Skipped));
        assert!(!RuntimeStatus::Success.can_transition_to(RuntimeStatus::Failed));
    }
}
