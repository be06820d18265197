//! Worker与网关之间的请求体
//!
//! 分区名不出现在请求中，网关根据认证后的Worker ID推导。

use serde::{Deserialize, Serialize};

use super::message::{QueueEntry, RuntimeReply};
use super::worker::HeartbeatMessage;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRequest {
    pub heartbeat: HeartbeatMessage,
    pub ttl_seconds: u64,
}

/// 拉取任务或控制消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollRequest {
    pub boot_id: String,
    pub count: usize,
    #[serde(default)]
    pub block_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckRequest {
    pub entry_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclaimRequest {
    pub boot_id: String,
    pub min_idle_ms: u64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenewRequest {
    pub boot_id: String,
    pub entry_ids: Vec<String>,
}

/// 控制消息来自两个分区，确认时需要带上分区
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlAckRequest {
    pub partition: String,
    pub entry_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlReplyRequest {
    pub reply_stream: String,
    pub reply: RuntimeReply,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntriesResponse {
    pub entries: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountResponse {
    pub count: usize,
}
