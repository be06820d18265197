//! Dispatcher组装
//!
//! 每个Dispatcher节点都参与选举并运行全部循环，循环内部只在持有领导权时
//! 干活。关闭信号通过 `broadcast` 分发，选举循环收到后主动释放租约。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use taskfleet_core::config::{BrokerConfig, DispatcherConfig, LeaderConfig};
use taskfleet_core::traits::{LockBackend, TaskQueue, TaskRepository, TaskRunRepository, WorkerRegistry};
use taskfleet_core::{SchedulerError, SchedulerResult};

use crate::controller::TaskController;
use crate::leader::{LeaderElection, LeadershipHandle};
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::resolver::ExecutionResolver;
use crate::result_consumer::ResultConsumer;
use crate::retry_service::TaskRetryService;
use crate::scheduler::{trigger_channel, TaskScheduler, TriggerHandle, TriggerRequest};
use crate::strategies::selector_from_name;

const TRIGGER_CHANNEL_CAPACITY: usize = 256;

/// Dispatcher依赖的存储与消息组件
#[derive(Clone)]
pub struct DispatcherDeps {
    pub task_repo: Arc<dyn TaskRepository>,
    pub run_repo: Arc<dyn TaskRunRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub lock: Arc<dyn LockBackend>,
    pub registry: Arc<dyn WorkerRegistry>,
}

pub struct DispatcherService {
    config: DispatcherConfig,
    election: Arc<LeaderElection>,
    scheduler: Arc<TaskScheduler>,
    results: Arc<ResultConsumer>,
    retry: Arc<TaskRetryService>,
    reconciler: Arc<Reconciler>,
    controller: Arc<TaskController>,
    trigger: TriggerHandle,
    trigger_rx: Mutex<Option<mpsc::Receiver<TriggerRequest>>>,
}

impl DispatcherService {
    pub fn new(
        config: &DispatcherConfig,
        leader: &LeaderConfig,
        broker: &BrokerConfig,
        deps: DispatcherDeps,
        node_id: impl Into<String>,
    ) -> Self {
        let node_id = node_id.into();
        let election = Arc::new(LeaderElection::new(deps.lock.clone(), leader, node_id.clone()));
        let leadership = election.handle();

        let resolver = Arc::new(ExecutionResolver::new(
            deps.registry.clone(),
            selector_from_name(&config.selector),
            config.worker_stale_seconds,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            deps.task_repo.clone(),
            deps.run_repo.clone(),
            deps.queue.clone(),
            resolver,
            leadership.clone(),
        ));
        let results = Arc::new(ResultConsumer::new(
            deps.run_repo.clone(),
            deps.queue.clone(),
            leadership.clone(),
            node_id.clone(),
            config.result_batch_size,
            Duration::from_millis(config.result_block_ms),
        ));
        let retry = Arc::new(TaskRetryService::new(
            deps.task_repo.clone(),
            deps.run_repo.clone(),
            scheduler.clone(),
            leadership.clone(),
            config.retry_jitter_factor,
        ));
        let reconciler = Arc::new(Reconciler::new(
            deps.task_repo.clone(),
            deps.run_repo.clone(),
            deps.registry.clone(),
            scheduler.clone(),
            leadership.clone(),
            ReconcileSettings::from(config),
        ));
        let controller = Arc::new(TaskController::new(
            deps.run_repo.clone(),
            deps.queue.clone(),
            leadership,
            node_id,
            Duration::from_secs(broker.reply_ttl_seconds),
            Duration::from_secs(config.runtime_manage_timeout_seconds),
        ));
        let (trigger, trigger_rx) = trigger_channel(TRIGGER_CHANNEL_CAPACITY);

        Self {
            config: config.clone(),
            election,
            scheduler,
            results,
            retry,
            reconciler,
            controller,
            trigger,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn leadership(&self) -> LeadershipHandle {
        self.election.handle()
    }

    pub fn node_id(&self) -> &str {
        self.election.node_id()
    }

    /// 手动触发入口，请求在调度循环内串行处理
    pub fn trigger_handle(&self) -> TriggerHandle {
        self.trigger.clone()
    }

    pub fn controller(&self) -> Arc<TaskController> {
        self.controller.clone()
    }

    /// 启动所有后台循环，只能调用一次
    pub async fn start(&self, shutdown_tx: &broadcast::Sender<()>) -> SchedulerResult<Vec<JoinHandle<()>>> {
        let trigger_rx = self
            .trigger_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SchedulerError::Internal("Dispatcher已经启动".to_string()))?;

        info!("启动Dispatcher节点 {}", self.node_id());
        let scan_interval = Duration::from_secs(self.config.scan_interval_seconds);
        let handles = vec![
            tokio::spawn(self.election.clone().run(shutdown_tx.subscribe())),
            tokio::spawn(self.scheduler.clone().run(scan_interval, trigger_rx, shutdown_tx.subscribe())),
            tokio::spawn(self.results.clone().run(shutdown_tx.subscribe())),
            tokio::spawn(self.retry.clone().run(
                Duration::from_secs(self.config.retry_scan_interval_seconds),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(self.reconciler.clone().run(
                Duration::from_secs(self.config.reconcile_interval_seconds),
                shutdown_tx.subscribe(),
            )),
        ];
        Ok(handles)
    }
}
