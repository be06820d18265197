//! 中继接口
//!
//! 分区名一律由认证得到的Worker ID推导，请求体中的ID只做一致性校验。

use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

use taskfleet_core::models::{
    AckRequest, ControlAckRequest, ControlReplyRequest, CountResponse, EntriesResponse, HeartbeatRequest, LogChunk,
    PollRequest, ReclaimRequest, RenewRequest, ResultMessage,
};
use taskfleet_core::partitions;
use taskfleet_core::traits::queue::enqueue_message;

use crate::auth::AuthenticatedWorker;
use crate::error::{GatewayError, GatewayResult};
use crate::routes::AppState;

/// 心跳TTL上限
const MAX_HEARTBEAT_TTL_SECONDS: u64 = 600;

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "taskfleet-gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn accepted() -> Json<Value> {
    Json(json!({"status": "accepted"}))
}

fn consumer(worker: &AuthenticatedWorker, boot_id: &str) -> GatewayResult<String> {
    if boot_id.is_empty() || boot_id.contains(':') {
        return Err(GatewayError::BadRequest(format!("无效的boot_id: {boot_id:?}")));
    }
    Ok(partitions::worker_consumer(&worker.worker_id, boot_id))
}

impl AppState {
    fn poll_count(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_poll_count)
    }

    fn poll_block(&self, requested: Option<u64>) -> Option<Duration> {
        requested.map(|ms| Duration::from_millis(ms).min(self.max_block))
    }
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<HeartbeatRequest>,
) -> GatewayResult<Json<Value>> {
    if request.heartbeat.worker_id != worker.worker_id {
        return Err(GatewayError::Forbidden(format!(
            "Worker {} 不能替 {} 上报心跳",
            worker.worker_id, request.heartbeat.worker_id
        )));
    }
    let ttl = Duration::from_secs(request.ttl_seconds.clamp(1, MAX_HEARTBEAT_TTL_SECONDS));
    state.registry.record_heartbeat(&request.heartbeat, ttl).await?;
    Ok(accepted())
}

pub async fn poll_tasks(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<PollRequest>,
) -> GatewayResult<Json<EntriesResponse>> {
    let consumer = consumer(&worker, &request.boot_id)?;
    let entries = state
        .queue
        .consume(
            &partitions::tasks(&worker.worker_id),
            partitions::WORKERS_GROUP,
            &consumer,
            state.poll_count(request.count),
            state.poll_block(request.block_ms),
        )
        .await?;
    Ok(Json(EntriesResponse { entries }))
}

pub async fn ack_tasks(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<AckRequest>,
) -> GatewayResult<Json<CountResponse>> {
    let count = state
        .queue
        .ack(&partitions::tasks(&worker.worker_id), partitions::WORKERS_GROUP, &request.entry_ids)
        .await?;
    Ok(Json(CountResponse { count }))
}

pub async fn reclaim_tasks(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<ReclaimRequest>,
) -> GatewayResult<Json<EntriesResponse>> {
    let consumer = consumer(&worker, &request.boot_id)?;
    let entries = state
        .queue
        .reclaim(
            &partitions::tasks(&worker.worker_id),
            partitions::WORKERS_GROUP,
            &consumer,
            Duration::from_millis(request.min_idle_ms),
            state.poll_count(request.count),
        )
        .await?;
    if !entries.is_empty() {
        info!("Worker {} 认领了 {} 个条目", worker.worker_id, entries.len());
    }
    Ok(Json(EntriesResponse { entries }))
}

pub async fn renew_tasks(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<RenewRequest>,
) -> GatewayResult<Json<CountResponse>> {
    let consumer = consumer(&worker, &request.boot_id)?;
    let count = state
        .queue
        .renew(
            &partitions::tasks(&worker.worker_id),
            partitions::WORKERS_GROUP,
            &consumer,
            &request.entry_ids,
        )
        .await?;
    Ok(Json(CountResponse { count }))
}

pub async fn publish_result(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(mut result): Json<ResultMessage>,
) -> GatewayResult<Json<Value>> {
    if let Some(claimed) = result.worker_id.as_deref().filter(|id| *id != worker.worker_id) {
        warn!("Worker {} 上报的结果声称来自 {}，已改写", worker.worker_id, claimed);
    }
    result.worker_id = Some(worker.worker_id);
    enqueue_message(state.queue.as_ref(), partitions::RESULTS, &result).await?;
    Ok(accepted())
}

pub async fn publish_logs(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(mut chunk): Json<LogChunk>,
) -> GatewayResult<Json<Value>> {
    if chunk.lines.is_empty() {
        return Ok(accepted());
    }
    chunk.worker_id = worker.worker_id;
    enqueue_message(state.queue.as_ref(), partitions::LOGS, &chunk).await?;
    Ok(accepted())
}

pub async fn poll_control(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<PollRequest>,
) -> GatewayResult<Json<EntriesResponse>> {
    let consumer = consumer(&worker, &request.boot_id)?;
    let group = partitions::control_group(&worker.worker_id);
    let count = state.poll_count(request.count);

    let mut entries = state
        .queue
        .consume(partitions::GLOBAL_CONTROL, &group, &consumer, count, None)
        .await?;
    let remaining = count.saturating_sub(entries.len());
    if remaining > 0 {
        let block = if entries.is_empty() {
            state.poll_block(request.block_ms)
        } else {
            None
        };
        entries.extend(
            state
                .queue
                .consume(&partitions::control(&worker.worker_id), &group, &consumer, remaining, block)
                .await?,
        );
    }
    Ok(Json(EntriesResponse { entries }))
}

pub async fn reclaim_control(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<ReclaimRequest>,
) -> GatewayResult<Json<EntriesResponse>> {
    let consumer = consumer(&worker, &request.boot_id)?;
    let group = partitions::control_group(&worker.worker_id);
    let min_idle = Duration::from_millis(request.min_idle_ms);
    let count = state.poll_count(request.count);

    let mut entries = state
        .queue
        .reclaim(partitions::GLOBAL_CONTROL, &group, &consumer, min_idle, count)
        .await?;
    let remaining = count.saturating_sub(entries.len());
    if remaining > 0 {
        entries.extend(
            state
                .queue
                .reclaim(&partitions::control(&worker.worker_id), &group, &consumer, min_idle, remaining)
                .await?,
        );
    }
    if !entries.is_empty() {
        info!("Worker {} 认领了 {} 条控制消息", worker.worker_id, entries.len());
    }
    Ok(Json(EntriesResponse { entries }))
}

pub async fn ack_control(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<ControlAckRequest>,
) -> GatewayResult<Json<CountResponse>> {
    if request.partition != partitions::GLOBAL_CONTROL && request.partition != partitions::control(&worker.worker_id)
    {
        return Err(GatewayError::Forbidden(format!(
            "Worker {} 不能确认分区 {}",
            worker.worker_id, request.partition
        )));
    }
    let count = state
        .queue
        .ack(
            &request.partition,
            &partitions::control_group(&worker.worker_id),
            &request.entry_ids,
        )
        .await?;
    Ok(Json(CountResponse { count }))
}

pub async fn reply(
    State(state): State<AppState>,
    Extension(worker): Extension<AuthenticatedWorker>,
    Json(request): Json<ControlReplyRequest>,
) -> GatewayResult<Json<Value>> {
    if request.reply_stream != partitions::reply(&request.reply.request_id) {
        return Err(GatewayError::BadRequest(format!(
            "回复通道 {} 与请求 {} 不匹配",
            request.reply_stream, request.reply.request_id
        )));
    }
    let mut reply = request.reply;
    reply.worker_id = worker.worker_id;
    enqueue_message(state.queue.as_ref(), &request.reply_stream, &reply).await?;
    Ok(accepted())
}
