use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::task::ResourceLimits;
use super::task_run::{DispatchStatus, RuntimeStatus, UpdateOrigin};
use crate::errors::{SchedulerError, SchedulerResult};

/// 从流分区中读出的一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// 流中的条目ID，同时作为ack/reclaim的凭据
    pub entry_id: String,
    pub partition: String,
    pub payload: serde_json::Value,
    /// 被投递的次数，reclaim时递增
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn decode<T: DeserializeOwned>(&self) -> SchedulerResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SchedulerError::Serialization(format!(
                "无法解析分区 {} 的条目 {}: {e}",
                self.partition, self.entry_id
            ))
        })
    }
}

/// 消费组中尚未ack的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub entry_id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u32,
}

/// 任务就绪消息，写入 `tasks:{worker_id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReadyPayload {
    pub execution_id: String,
    pub task_id: i64,
    pub project_id: i64,
    pub params: serde_json::Value,
    pub priority: i32,
    pub enqueue_time: DateTime<Utc>,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
}

fn default_attempt() -> u32 {
    1
}

/// 控制通道消息，按 `control_type` 区分
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "control_type", rename_all = "snake_case")]
pub enum ControlMessage {
    Cancel {
        task_id: i64,
        run_id: String,
        reason: String,
    },
    ConfigUpdate {
        config: serde_json::Value,
    },
    RuntimeManage {
        action: String,
        request_id: String,
        reply_stream: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl ControlMessage {
    pub fn control_type(&self) -> &'static str {
        match self {
            ControlMessage::Cancel { .. } => "cancel",
            ControlMessage::ConfigUpdate { .. } => "config_update",
            ControlMessage::RuntimeManage { .. } => "runtime_manage",
        }
    }
}

/// `runtime_manage` 的回复，写入 `reply:{request_id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeReply {
    pub request_id: String,
    pub worker_id: String,
    pub ok: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// 单条状态轨道上的变更
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "track", content = "status", rename_all = "snake_case")]
pub enum StatusChange {
    Dispatch(DispatchStatus),
    Runtime(RuntimeStatus),
}

impl std::fmt::Display for StatusChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusChange::Dispatch(s) => write!(f, "dispatch={s}"),
            StatusChange::Runtime(s) => write!(f, "runtime={s}"),
        }
    }
}

/// 结果消息，写入 `results`，由Leader上的结果消费者按 `run_id` 幂等应用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMessage {
    pub run_id: String,
    pub status: StatusChange,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub entry_id: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// 逻辑时间戳（毫秒），用于丢弃乱序到达的旧消息
    pub reported_at: i64,
    /// 不上线路，经流或网关到达的结果一律视为Worker上报
    #[serde(skip)]
    pub origin: UpdateOrigin,
}

impl ResultMessage {
    pub fn new(run_id: impl Into<String>, status: StatusChange) -> Self {
        Self {
            run_id: run_id.into(),
            status,
            worker_id: None,
            entry_id: None,
            exit_code: None,
            error_message: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            data: None,
            reported_at: Utc::now().timestamp_millis(),
            origin: UpdateOrigin::Worker,
        }
    }

    pub fn dispatch(run_id: impl Into<String>, status: DispatchStatus) -> Self {
        Self::new(run_id, StatusChange::Dispatch(status))
    }

    pub fn runtime(run_id: impl Into<String>, status: RuntimeStatus) -> Self {
        Self::new(run_id, StatusChange::Runtime(status))
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_reported_at(mut self, reported_at: i64) -> Self {
        self.reported_at = reported_at;
        self
    }

    /// 标记为Dispatcher自身产生的更新
    pub fn from_dispatcher(mut self) -> Self {
        self.origin = UpdateOrigin::Dispatcher;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub execution_id: String,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// 一批日志，写入 `logs`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogChunk {
    pub worker_id: String,
    pub lines: Vec<LogLine>,
}
