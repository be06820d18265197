//! Worker服务
//!
//! 由五类循环组成：任务拉取、N个执行槽、心跳、控制消息和日志上报。
//! 拉取只消费本地队列剩余容量对应数量的条目；条目在结果发布之后才ack，
//! 持有期间由心跳循环续期，进程崩溃后由下一个实例或其他消费者认领。

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskfleet_core::config::WorkerConfig;
use taskfleet_core::models::{
    ControlMessage, DispatchStatus, LogChunk, LogLine, QueueEntry, ResultMessage, RuntimeReply, RuntimeStatus,
    SandboxPolicy, TaskReadyPayload, WorkerStatus,
};
use taskfleet_core::{retry_with_backoff, Backoff, SchedulerError, SchedulerResult};

use crate::channel::WorkerChannel;
use crate::executor::{CancelToken, ExecutorSettings, ProcessExecutor};
use crate::heartbeat::{parse_capabilities, SystemSampler, WorkerIdentity};
use crate::local_scheduler::{LocalScheduler, LocalSchedulerConfig};
use crate::plugin::{PluginContext, PluginRegistry};

/// 单次拉取的条目上限
const MAX_POLL_BATCH: usize = 32;
const CONTROL_BATCH: usize = 16;
/// 发布结果的本地重试次数
const PUBLISH_ATTEMPTS: u32 = 5;

/// 已被本Worker接收、尚未结束的执行
struct Inflight {
    /// 同一执行可能被重复投递，结束时全部ack
    entry_ids: Vec<String>,
    cancel: CancelToken,
    cancel_reason: Option<String>,
    running: bool,
}

pub struct WorkerService {
    config: WorkerConfig,
    identity: WorkerIdentity,
    channel: Arc<dyn WorkerChannel>,
    queue: LocalScheduler<TaskReadyPayload>,
    plugins: PluginRegistry,
    executor: ProcessExecutor,
    sandbox: SandboxPolicy,
    inflight: Mutex<HashMap<String, Inflight>>,
    status: RwLock<WorkerStatus>,
    max_concurrency: AtomicUsize,
    active_slots: AtomicUsize,
    log_tx: mpsc::Sender<LogLine>,
    log_rx: Mutex<Option<mpsc::Receiver<LogLine>>>,
    started: AtomicBool,
    backoff: Backoff,
}

impl WorkerService {
    pub fn new(
        config: WorkerConfig,
        channel: Arc<dyn WorkerChannel>,
        worker_id: impl Into<String>,
        boot_id: impl Into<String>,
    ) -> Self {
        let identity = WorkerIdentity {
            worker_id: worker_id.into(),
            boot_id: boot_id.into(),
            hostname: local_hostname(),
            transport: config.transport,
            capabilities: parse_capabilities(&config.capabilities),
            resource_limits: config.default_limits.clone(),
        };
        let sandbox = SandboxPolicy {
            env_allowlist: config.env_allowlist.clone(),
            scratch_dir: config.scratch_dir,
            wrapper: config.wrapper.clone(),
        };
        let (log_tx, log_rx) = mpsc::channel(config.log_batch_size.max(1) * 16);
        Self {
            queue: LocalScheduler::new(LocalSchedulerConfig::from(&config)),
            executor: ProcessExecutor::new(ExecutorSettings::from(&config)),
            plugins: PluginRegistry::with_builtins(),
            max_concurrency: AtomicUsize::new(config.max_concurrency),
            identity,
            channel,
            sandbox,
            inflight: Mutex::new(HashMap::new()),
            status: RwLock::new(WorkerStatus::Online),
            active_slots: AtomicUsize::new(0),
            log_tx,
            log_rx: Mutex::new(Some(log_rx)),
            started: AtomicBool::new(false),
            backoff: Backoff::default(),
            config,
        }
    }

    /// 替换插件注册表，用于注册自定义插件
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.identity.worker_id
    }

    pub fn boot_id(&self) -> &str {
        &self.identity.boot_id
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.status.read().await
    }

    pub async fn running_count(&self) -> usize {
        self.inflight.lock().await.values().filter(|f| f.running).count()
    }

    /// 启动全部循环；只能调用一次
    pub async fn start(self: &Arc<Self>, shutdown_tx: &broadcast::Sender<()>) -> SchedulerResult<Vec<JoinHandle<()>>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::Internal("Worker服务已经启动".to_string()));
        }
        info!(
            "启动Worker {} (boot={}, 并发={}, 队列容量={})",
            self.identity.worker_id, self.identity.boot_id, self.config.max_concurrency, self.config.queue_capacity
        );

        let mut handles = Vec::new();
        let slots = self.config.max_concurrency.max(1);
        self.active_slots.store(slots, Ordering::SeqCst);
        for slot in 0..slots {
            let service = Arc::clone(self);
            let rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { service.slot_loop(slot, rx).await }));
        }

        let service = Arc::clone(self);
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { service.poll_loop(rx).await }));

        let service = Arc::clone(self);
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { service.heartbeat_loop(rx).await }));

        let service = Arc::clone(self);
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { service.control_loop(rx).await }));

        let service = Arc::clone(self);
        let rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { service.log_loop(rx).await }));

        Ok(handles)
    }

    /// 等待循环在关闭超时内退出，超时后取消仍在运行的执行
    pub async fn await_shutdown(&self, mut handles: Vec<JoinHandle<()>>) {
        let timeout = Duration::from_secs(self.config.shutdown_timeout_seconds);
        let all = futures::future::join_all(handles.iter_mut());
        if tokio::time::timeout(timeout, all).await.is_ok() {
            info!("Worker {} 已停止", self.identity.worker_id);
            return;
        }

        warn!("等待 {timeout:?} 后仍有执行未结束，取消剩余执行");
        self.cancel_all("Worker关闭").await;
        let grace = self.executor.settings().grace_period + Duration::from_secs(5);
        if tokio::time::timeout(grace, futures::future::join_all(handles)).await.is_err() {
            error!("Worker {} 的部分循环未能退出", self.identity.worker_id);
        }
    }

    pub async fn cancel_all(&self, reason: &str) {
        let mut inflight = self.inflight.lock().await;
        for flight in inflight.values_mut() {
            flight.cancel_reason.get_or_insert_with(|| reason.to_string());
            flight.cancel.cancel();
        }
    }

    async fn slot_loop(self: Arc<Self>, slot: usize, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("执行槽 {slot} 启动");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                (execution_id, payload) = self.queue.dequeue() => {
                    self.execute(execution_id, payload).await;
                }
            }
        }
        self.active_slots.fetch_sub(1, Ordering::SeqCst);
        debug!("执行槽 {slot} 退出");
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let block = Duration::from_millis(self.config.poll_block_ms);
        let min_idle = Duration::from_secs(self.config.reclaim_min_idle_seconds);
        let reclaim_every = Duration::from_secs(self.config.reclaim_interval_seconds.max(1));
        // 启动时先认领上一个进程实例遗留的条目
        let mut last_reclaim: Option<tokio::time::Instant> = None;
        let mut failures = 0u32;

        loop {
            let free = self.free_capacity().await;
            if free == 0 || self.status().await == WorkerStatus::Draining {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(block) => continue,
                }
            }

            if last_reclaim.map_or(true, |at| at.elapsed() >= reclaim_every) {
                last_reclaim = Some(tokio::time::Instant::now());
                self.reclaim(min_idle, free).await;
                continue;
            }

            // 拉取不放进select，避免取消进行中的读取
            let polled = self.channel.poll_tasks(free.min(MAX_POLL_BATCH), Some(block)).await;
            match polled {
                Ok(entries) => {
                    failures = 0;
                    for entry in entries {
                        self.admit(entry).await;
                    }
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff_delay(&e, failures);
                    warn!("拉取任务失败: {e}，{delay:?} 后重试");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }
        }
        info!("任务拉取循环退出");
    }

    async fn reclaim(&self, min_idle: Duration, count: usize) {
        match self.channel.reclaim_tasks(min_idle, count).await {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!("认领了 {} 个空闲任务条目", entries.len());
                }
                for entry in entries {
                    self.admit(entry).await;
                }
            }
            Err(e) => warn!("认领空闲任务条目失败: {e}"),
        }
    }

    async fn free_capacity(&self) -> usize {
        self.queue.capacity().await.saturating_sub(self.queue.len().await)
    }

    fn backoff_delay(&self, error: &SchedulerError, failures: u32) -> Duration {
        match error {
            SchedulerError::RateLimited { retry_after_seconds } => Duration::from_secs(*retry_after_seconds),
            _ => self.backoff.delay_for(failures),
        }
    }

    /// 接收一个任务条目进入本地队列
    pub(crate) async fn admit(&self, entry: QueueEntry) {
        let payload: TaskReadyPayload = match entry.decode() {
            Ok(payload) => payload,
            Err(e) => {
                // 无法解析的条目重试也没有意义
                error!("丢弃无法解析的任务条目 {}: {e}", entry.entry_id);
                if let Err(e) = self.channel.ack_tasks(&[entry.entry_id.clone()]).await {
                    warn!("确认无效条目失败: {e}");
                }
                return;
            }
        };
        let execution_id = payload.execution_id.clone();

        {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get_mut(&execution_id) {
                if !existing.entry_ids.contains(&entry.entry_id) {
                    existing.entry_ids.push(entry.entry_id.clone());
                }
                debug!("执行 {execution_id} 已在本地，跳过重复投递 {}", entry.entry_id);
                metrics::counter!("taskfleet_worker_duplicate_deliveries_total").increment(1);
                return;
            }
            inflight.insert(
                execution_id.clone(),
                Inflight {
                    entry_ids: vec![entry.entry_id.clone()],
                    cancel: CancelToken::new(),
                    cancel_reason: None,
                    running: false,
                },
            );
        }

        let timeout = Duration::from_millis(self.config.admission_timeout_ms);
        match self.queue.enqueue(&execution_id, payload.priority, payload, timeout).await {
            Ok(_) => {
                debug!("执行 {execution_id} 进入本地队列 (投递次数 {})", entry.delivery_count);
                let mut ack = ResultMessage::dispatch(&execution_id, DispatchStatus::Acked)
                    .with_worker(self.identity.worker_id.clone());
                ack.entry_id = Some(entry.entry_id);
                if let Err(e) = self.publish(&ack).await {
                    warn!("上报执行 {execution_id} 的接收确认失败: {e}");
                }
            }
            Err(e) => {
                // 条目保持待确认，之后由认领扫描重新接收
                warn!("执行 {execution_id} 未能进入本地队列: {e}");
                self.inflight.lock().await.remove(&execution_id);
            }
        }
    }

    async fn execute(&self, execution_id: String, payload: TaskReadyPayload) {
        let cancel = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get_mut(&execution_id) {
                Some(flight) => {
                    flight.running = true;
                    flight.cancel.clone()
                }
                None => {
                    debug!("执行 {execution_id} 已不在本地，跳过");
                    return;
                }
            }
        };
        metrics::gauge!("taskfleet_worker_running_tasks").increment(1.0);

        let default_timeout = Duration::from_secs(self.config.default_timeout_seconds);
        let ctx = PluginContext::for_payload(&payload, default_timeout, &self.config.default_limits, &self.sandbox);
        let plan = match self.plugins.build_plan(&ctx, &payload.params) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("执行 {execution_id} 无法生成执行计划: {e}");
                let mut message = self.runtime_message(&execution_id, RuntimeStatus::Failed).with_error(e.to_string());
                message.data = Some(serde_json::json!({"exit_reason": "plugin_validation"}));
                message.finished_at = Some(Utc::now());
                self.finish(&execution_id, message).await;
                metrics::gauge!("taskfleet_worker_running_tasks").decrement(1.0);
                return;
            }
        };

        let mut running = self.runtime_message(&execution_id, RuntimeStatus::Running);
        running.started_at = Some(Utc::now());
        if let Err(e) = self.publish(&running).await {
            warn!("上报执行 {execution_id} 开始运行失败: {e}");
        }

        let result = self.executor.execute(&plan, self.log_tx.clone(), cancel).await;

        let mut message = self.runtime_message(&execution_id, result.runtime_status());
        message.exit_code = result.exit_code;
        message.error_message = result.effective_error_message();
        message.started_at = Some(result.started_at);
        message.finished_at = Some(result.finished_at);
        message.duration_ms = Some(result.duration_ms);
        message.data = Some(result.summary());
        if result.runtime_status() == RuntimeStatus::Cancelled {
            if let Some(reason) = self.cancel_reason(&execution_id).await {
                message.error_message = Some(format!("执行被取消: {reason}"));
            }
        }
        self.finish(&execution_id, message).await;
        metrics::gauge!("taskfleet_worker_running_tasks").decrement(1.0);
    }

    fn runtime_message(&self, execution_id: &str, status: RuntimeStatus) -> ResultMessage {
        ResultMessage::runtime(execution_id, status).with_worker(self.identity.worker_id.clone())
    }

    async fn cancel_reason(&self, execution_id: &str) -> Option<String> {
        self.inflight
            .lock()
            .await
            .get(execution_id)
            .and_then(|f| f.cancel_reason.clone())
    }

    /// 发布终态结果后ack该执行持有的全部条目
    async fn finish(&self, execution_id: &str, message: ResultMessage) {
        let flight = self.inflight.lock().await.remove(execution_id);
        if let Err(e) = self.publish(&message).await {
            // 不ack，条目停止续期后会被重新认领执行
            error!("发布执行 {execution_id} 的结果失败: {e}");
            return;
        }
        let Some(flight) = flight else { return };
        if let Err(e) = self.channel.ack_tasks(&flight.entry_ids).await {
            warn!("确认执行 {execution_id} 的任务条目失败: {e}");
        }
    }

    async fn publish(&self, message: &ResultMessage) -> SchedulerResult<()> {
        retry_with_backoff(&self.backoff, PUBLISH_ATTEMPTS, "发布执行结果", || {
            self.channel.publish_result(message)
        })
        .await
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let ttl = Duration::from_secs(self.config.heartbeat_ttl_seconds);
        let mut ticker = interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sampler = SystemSampler::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.status().await;
                    self.send_heartbeat(&mut sampler, status, ttl).await;
                    self.renew_held().await;
                }
                _ = shutdown_rx.recv() => {
                    self.send_heartbeat(&mut sampler, WorkerStatus::Offline, ttl).await;
                    break;
                }
            }
        }
        info!("心跳循环退出");
    }

    async fn send_heartbeat(&self, sampler: &mut SystemSampler, status: WorkerStatus, ttl: Duration) {
        let heartbeat = self.identity.heartbeat(
            status,
            sampler.sample(),
            self.running_count().await,
            self.max_concurrency.load(Ordering::Relaxed),
        );
        if let Err(e) = self.channel.heartbeat(&heartbeat, ttl).await {
            warn!("发送心跳失败: {e}");
        }
    }

    /// 续期排队中和运行中的条目，避免被其他消费者认领
    async fn renew_held(&self) {
        let entry_ids: Vec<String> = self
            .inflight
            .lock()
            .await
            .values()
            .flat_map(|f| f.entry_ids.iter().cloned())
            .collect();
        if entry_ids.is_empty() {
            return;
        }
        match self.channel.renew_tasks(&entry_ids).await {
            Ok(renewed) if renewed < entry_ids.len() => {
                debug!("续期 {}/{} 个条目，其余已被认领或确认", renewed, entry_ids.len());
            }
            Ok(_) => {}
            Err(e) => warn!("续期任务条目失败: {e}"),
        }
    }

    async fn control_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let block = Duration::from_millis(self.config.poll_block_ms);
        let min_idle = Duration::from_secs(self.config.reclaim_min_idle_seconds);
        let reclaim_every = Duration::from_secs(self.config.reclaim_interval_seconds.max(1));
        // 启动时先认领上一个进程实例读到但没确认的控制消息
        let mut last_reclaim: Option<tokio::time::Instant> = None;
        let mut failures = 0u32;

        loop {
            if last_reclaim.map_or(true, |at| at.elapsed() >= reclaim_every) {
                last_reclaim = Some(tokio::time::Instant::now());
                self.reclaim_control(min_idle).await;
            }

            // 与任务拉取相同，读取不放进select
            match self.channel.poll_control(CONTROL_BATCH, Some(block)).await {
                Ok(entries) => {
                    failures = 0;
                    for entry in entries {
                        self.handle_control_entry(entry).await;
                    }
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff_delay(&e, failures);
                    warn!("拉取控制消息失败: {e}，{delay:?} 后重试");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }
        }
        info!("控制消息循环退出");
    }

    async fn reclaim_control(&self, min_idle: Duration) {
        match self.channel.reclaim_control(min_idle, CONTROL_BATCH).await {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!("认领了 {} 条未确认的控制消息", entries.len());
                }
                for entry in entries {
                    self.handle_control_entry(entry).await;
                }
            }
            Err(e) => warn!("认领控制消息失败: {e}"),
        }
    }

    async fn handle_control_entry(&self, entry: QueueEntry) {
        match entry.decode::<ControlMessage>() {
            Ok(message) => {
                debug!("收到控制消息 {} ({})", message.control_type(), entry.entry_id);
                self.handle_control(message).await;
            }
            Err(e) => error!("丢弃无法解析的控制消息: {e}"),
        }
        if let Err(e) = self.channel.ack_control(&entry.partition, &[entry.entry_id.clone()]).await {
            warn!("确认控制消息 {} 失败: {e}", entry.entry_id);
        }
    }

    pub async fn handle_control(&self, message: ControlMessage) {
        match message {
            ControlMessage::Cancel { run_id, reason, .. } => self.cancel(&run_id, &reason).await,
            ControlMessage::ConfigUpdate { config } => {
                let applied = self.apply_config(&config).await;
                info!("应用配置更新: {applied:?}");
            }
            ControlMessage::RuntimeManage {
                action,
                request_id,
                reply_stream,
                payload,
            } => {
                let outcome = self.runtime_manage(&action, &payload).await;
                let reply = match outcome {
                    Ok(data) => RuntimeReply {
                        request_id,
                        worker_id: self.identity.worker_id.clone(),
                        ok: true,
                        data,
                        error: None,
                    },
                    Err(error) => RuntimeReply {
                        request_id,
                        worker_id: self.identity.worker_id.clone(),
                        ok: false,
                        data: serde_json::Value::Null,
                        error: Some(error),
                    },
                };
                if !reply_stream.starts_with("reply:") {
                    warn!("忽略非法的回复通道 {reply_stream}");
                    return;
                }
                if let Err(e) = self.channel.reply(&reply_stream, &reply).await {
                    warn!("回复管理请求 {} 失败: {e}", reply.request_id);
                }
            }
        }
    }

    async fn cancel(&self, execution_id: &str, reason: &str) {
        let running = {
            let mut inflight = self.inflight.lock().await;
            let Some(flight) = inflight.get_mut(execution_id) else {
                debug!("取消请求的执行 {execution_id} 不在本Worker上");
                return;
            };
            flight.cancel_reason = Some(reason.to_string());
            flight.cancel.cancel();
            flight.running
        };
        if running {
            info!("取消运行中的执行 {execution_id}: {reason}");
            return;
        }
        // 排队中的直接移出队列；若已被执行槽取走，取消信号会让它立即结束
        if self.queue.remove(execution_id).await.is_some() {
            info!("取消排队中的执行 {execution_id}: {reason}");
            let mut message = self
                .runtime_message(execution_id, RuntimeStatus::Cancelled)
                .with_error(format!("排队中被取消: {reason}"));
            message.finished_at = Some(Utc::now());
            self.finish(execution_id, message).await;
        }
    }

    /// 返回实际生效的配置项
    pub async fn apply_config(&self, config: &serde_json::Value) -> Vec<&'static str> {
        let mut applied = Vec::new();
        if let Some(capacity) = config.get("queue_capacity").and_then(|v| v.as_u64()).filter(|c| *c > 0) {
            self.queue.set_capacity(capacity as usize).await;
            applied.push("queue_capacity");
        }
        if let Some(max) = config.get("max_concurrency").and_then(|v| v.as_u64()).filter(|c| *c > 0) {
            // 执行槽数量在启动时固定，这里只影响心跳中上报的值
            self.max_concurrency.store(max as usize, Ordering::Relaxed);
            applied.push("max_concurrency");
        }
        let interval = config.get("aging_interval_seconds").and_then(|v| v.as_u64()).filter(|s| *s > 0);
        let step = config
            .get("aging_step")
            .and_then(|v| v.as_i64())
            .filter(|s| *s > 0)
            .map(|s| s.min(i32::MAX as i64) as i32);
        if interval.is_some() || step.is_some() {
            let (current_interval, current_step) = self.queue.aging().await;
            self.queue
                .set_aging(
                    interval.map(Duration::from_secs).unwrap_or(current_interval),
                    step.unwrap_or(current_step),
                )
                .await;
            applied.push("aging");
        }
        applied
    }

    pub async fn runtime_manage(&self, action: &str, payload: &serde_json::Value) -> Result<serde_json::Value, String> {
        match action {
            "status" => Ok(serde_json::json!({
                "worker_id": self.identity.worker_id,
                "boot_id": self.identity.boot_id,
                "status": self.status().await,
                "running": self.running_count().await,
                "queued": self.queue.len().await,
                "capacity": self.queue.capacity().await,
                "max_concurrency": self.max_concurrency.load(Ordering::Relaxed),
                "queue": self.queue.snapshot().await,
            })),
            "drain" => {
                *self.status.write().await = WorkerStatus::Draining;
                info!("Worker {} 进入排空状态", self.identity.worker_id);
                Ok(serde_json::json!({"status": WorkerStatus::Draining}))
            }
            "resume" => {
                *self.status.write().await = WorkerStatus::Online;
                info!("Worker {} 恢复接收任务", self.identity.worker_id);
                Ok(serde_json::json!({"status": WorkerStatus::Online}))
            }
            "set_capacity" => {
                let capacity = payload
                    .get("capacity")
                    .and_then(|v| v.as_u64())
                    .filter(|c| *c > 0)
                    .ok_or_else(|| "capacity 必须是正整数".to_string())?;
                self.queue.set_capacity(capacity as usize).await;
                Ok(serde_json::json!({"capacity": capacity}))
            }
            other => Err(format!("未知的管理操作: {other}")),
        }
    }

    async fn log_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let Some(mut rx) = self.log_rx.lock().await.take() else {
            return;
        };
        let batch_size = self.config.log_batch_size.max(1);
        let mut buffer: Vec<LogLine> = Vec::with_capacity(batch_size);
        let mut flush = interval(Duration::from_millis(self.config.log_flush_interval_ms.max(10)));
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stopping = false;

        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        buffer.push(line);
                        if buffer.len() >= batch_size {
                            self.ship_logs(&mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = flush.tick() => {
                    if !buffer.is_empty() {
                        self.ship_logs(&mut buffer).await;
                    }
                    // 执行槽全部退出后不会再有新日志
                    if stopping && self.active_slots.load(Ordering::SeqCst) == 0 {
                        while let Ok(line) = rx.try_recv() {
                            buffer.push(line);
                        }
                        if !buffer.is_empty() {
                            self.ship_logs(&mut buffer).await;
                        }
                        break;
                    }
                }
                _ = shutdown_rx.recv(), if !stopping => stopping = true,
            }
        }
        debug!("日志上报循环退出");
    }

    async fn ship_logs(&self, buffer: &mut Vec<LogLine>) {
        let chunk = LogChunk {
            worker_id: self.identity.worker_id.clone(),
            lines: std::mem::take(buffer),
        };
        let count = chunk.lines.len();
        if let Err(e) = self.channel.publish_logs(&chunk).await {
            // 日志尽力而为，不阻塞执行
            warn!("上报 {count} 行日志失败: {e}");
            metrics::counter!("taskfleet_worker_log_lines_dropped_total").increment(count as u64);
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 未配置时使用主机名作为Worker ID
pub fn resolve_worker_id(config: &WorkerConfig) -> String {
    config
        .worker_id
        .clone()
        .unwrap_or_else(|| local_hostname().replace(':', "-"))
}

/// 每次进程启动生成新的启动ID
pub fn new_boot_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DirectChannel;
    use taskfleet_core::partitions;
    use taskfleet_core::traits::queue::enqueue_message;
    use taskfleet_core::traits::TaskQueue;
    use taskfleet_infrastructure::{InMemoryStreamQueue, InMemoryWorkerRegistry};

    fn service(queue: Arc<InMemoryStreamQueue>, config: WorkerConfig) -> WorkerService {
        let channel = Arc::new(DirectChannel::new(queue, Arc::new(InMemoryWorkerRegistry::new()), "w1", "b1"));
        WorkerService::new(config, channel, "w1", "b1")
    }

    fn payload(execution_id: &str, params: serde_json::Value) -> TaskReadyPayload {
        TaskReadyPayload {
            execution_id: execution_id.to_string(),
            task_id: 1,
            project_id: 1,
            params,
            priority: 5,
            enqueue_time: Utc::now(),
            timeout_seconds: 0,
            attempt: 1,
            resource_limits: None,
        }
    }

    async fn entry(queue: &InMemoryStreamQueue, payload: &TaskReadyPayload) -> QueueEntry {
        enqueue_message(queue, &partitions::tasks("w1"), payload).await.unwrap();
        queue
            .consume(&partitions::tasks("w1"), partitions::WORKERS_GROUP, "w1:b1", 1, None)
            .await
            .unwrap()
            .remove(0)
    }

    async fn results(queue: &InMemoryStreamQueue) -> Vec<ResultMessage> {
        queue
            .consume(partitions::RESULTS, partitions::DISPATCHERS_GROUP, "test", 100, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.decode().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_duplicate_delivery_tracks_both_entries() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = service(queue.clone(), WorkerConfig::default());
        let p = payload("e1", serde_json::json!({"command": "true"}));
        service.admit(entry(&queue, &p).await).await;
        service.admit(entry(&queue, &p).await).await;

        assert_eq!(service.queue.len().await, 1);
        assert_eq!(service.inflight.lock().await["e1"].entry_ids.len(), 2);
        let acks = results(&queue).await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, taskfleet_core::models::StatusChange::Dispatch(DispatchStatus::Acked));
        assert!(acks[0].entry_id.is_some());
    }

    #[tokio::test]
    async fn test_cancel_queued_reports_cancelled_and_acks() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = service(queue.clone(), WorkerConfig::default());
        service
            .admit(entry(&queue, &payload("e1", serde_json::json!({"command": "true"}))).await)
            .await;

        service.cancel("e1", "用户取消").await;
        assert!(service.queue.is_empty().await);
        let messages = results(&queue).await;
        let last = messages.last().unwrap();
        assert_eq!(last.status, taskfleet_core::models::StatusChange::Runtime(RuntimeStatus::Cancelled));
        assert!(last.error_message.as_ref().unwrap().contains("用户取消"));
        assert!(queue
            .pending(&partitions::tasks("w1"), partitions::WORKERS_GROUP)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_plugin_failure_reports_failed_without_running() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = service(queue.clone(), WorkerConfig::default());
        let p = payload("e1", serde_json::json!({"unknown": 1}));
        service.admit(entry(&queue, &p).await).await;
        let (id, p) = service.queue.try_dequeue().await.unwrap();
        service.execute(id, p).await;

        let statuses: Vec<_> = results(&queue).await.into_iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![
                taskfleet_core::models::StatusChange::Dispatch(DispatchStatus::Acked),
                taskfleet_core::models::StatusChange::Runtime(RuntimeStatus::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_plugin_registry_matches_nothing() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = service(queue.clone(), WorkerConfig::default()).with_plugins(PluginRegistry::new());
        let p = payload("e1", serde_json::json!({"command": "true"}));
        service.admit(entry(&queue, &p).await).await;
        let (id, p) = service.queue.try_dequeue().await.unwrap();
        service.execute(id, p).await;

        let last = results(&queue).await.pop().unwrap();
        assert_eq!(last.status, taskfleet_core::models::StatusChange::Runtime(RuntimeStatus::Failed));
        assert_eq!(last.data.unwrap()["exit_reason"], "plugin_validation");
    }

    #[tokio::test]
    async fn test_config_update_and_runtime_manage() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = service(queue, WorkerConfig::default());
        let applied = service
            .apply_config(&serde_json::json!({"queue_capacity": 7, "aging_step": 2, "bogus": true}))
            .await;
        assert_eq!(applied, vec!["queue_capacity", "aging"]);
        assert_eq!(service.queue.capacity().await, 7);
        assert_eq!(service.queue.aging().await.1, 2);

        service.runtime_manage("drain", &serde_json::Value::Null).await.unwrap();
        assert_eq!(service.status().await, WorkerStatus::Draining);
        let status = service.runtime_manage("status", &serde_json::Value::Null).await.unwrap();
        assert_eq!(status["status"], "draining");
        assert_eq!(status["capacity"], 7);
        assert!(service
            .runtime_manage("set_capacity", &serde_json::json!({"capacity": 0}))
            .await
            .is_err());
        assert!(service.runtime_manage("reboot", &serde_json::Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_read_by_previous_incarnation_is_handled() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = service(queue.clone(), WorkerConfig::default());
        service
            .admit(entry(&queue, &payload("e1", serde_json::json!({"command": "true"}))).await)
            .await;

        let cancel = ControlMessage::Cancel {
            task_id: 1,
            run_id: "e1".to_string(),
            reason: "用户取消".to_string(),
        };
        enqueue_message(queue.as_ref(), &partitions::control("w1"), &cancel)
            .await
            .unwrap();
        // 上一个进程实例读到了取消消息但没有确认
        let group = partitions::control_group("w1");
        let stolen = queue
            .consume(&partitions::control("w1"), &group, "w1:b0", 1, None)
            .await
            .unwrap();
        assert_eq!(stolen.len(), 1);

        service.reclaim_control(Duration::ZERO).await;
        assert!(service.queue.is_empty().await);
        let last = results(&queue).await.pop().unwrap();
        assert_eq!(last.status, taskfleet_core::models::StatusChange::Runtime(RuntimeStatus::Cancelled));
        assert!(queue
            .pending(&partitions::control("w1"), &group)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_acked() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = service(queue.clone(), WorkerConfig::default());
        queue
            .enqueue(&partitions::tasks("w1"), &serde_json::json!({"garbage": true}))
            .await
            .unwrap();
        let entry = queue
            .consume(&partitions::tasks("w1"), partitions::WORKERS_GROUP, "w1:b1", 1, None)
            .await
            .unwrap()
            .remove(0);
        service.admit(entry).await;
        assert!(service.queue.is_empty().await);
        assert!(queue
            .pending(&partitions::tasks("w1"), partitions::WORKERS_GROUP)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let queue = Arc::new(InMemoryStreamQueue::new());
        let service = Arc::new(service(queue, WorkerConfig::default()));
        let (tx, _) = broadcast::channel(1);
        let handles = service.start(&tx).await.unwrap();
        assert!(service.start(&tx).await.is_err());
        tx.send(()).unwrap();
        service.await_shutdown(handles).await;
    }
}
