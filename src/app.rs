use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use taskfleet_core::config::AppConfig;
use taskfleet_dispatcher::{DispatcherDeps, DispatcherService};
use taskfleet_infrastructure::{BrokerFactory, BrokerHandles, InMemoryTaskRepository};
use taskfleet_worker::{channel_for, new_boot_id, resolve_worker_id, WorkerService};

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AppMode {
    /// 仅运行Dispatcher
    Dispatcher,
    /// 仅运行Worker
    Worker,
    /// 仅运行Worker接入网关
    Gateway,
    /// 在同一进程内运行所有组件
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    broker: BrokerHandles,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        check_mode_enabled(&config, mode)?;
        let broker = BrokerFactory::create(&config.broker)
            .await
            .context("连接broker失败")?;
        Ok(Self { config, mode, broker })
    }

    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        match self.mode {
            AppMode::Dispatcher => self.run_dispatcher(&shutdown).await,
            AppMode::Worker => self.run_worker(&shutdown).await,
            AppMode::Gateway => self.run_gateway(&shutdown).await,
            AppMode::All => {
                tokio::try_join!(
                    self.run_dispatcher(&shutdown),
                    self.run_worker(&shutdown),
                    self.run_gateway(&shutdown),
                )?;
                Ok(())
            }
        }
    }

    async fn run_dispatcher(&self, shutdown: &ShutdownManager) -> Result<()> {
        let task_repo = match &self.config.dispatcher.tasks_file {
            Some(path) => InMemoryTaskRepository::load_from_file(Path::new(path))
                .await
                .with_context(|| format!("加载任务定义失败: {path}"))?,
            None => {
                warn!("未配置tasks_file，Dispatcher将以空任务表启动");
                InMemoryTaskRepository::new()
            }
        };
        let deps = DispatcherDeps {
            task_repo: Arc::new(task_repo),
            run_repo: self.broker.runs.clone(),
            queue: self.broker.queue.clone(),
            lock: self.broker.lock.clone(),
            registry: self.broker.registry.clone(),
        };
        let node_id = self.config.leader.resolve_node_id(&local_hostname());
        let service = DispatcherService::new(
            &self.config.dispatcher,
            &self.config.leader,
            &self.config.broker,
            deps,
            node_id,
        );

        let handles = service.start(shutdown.sender()).await?;
        futures::future::join_all(handles).await;
        info!("Dispatcher服务已停止");
        Ok(())
    }

    async fn run_worker(&self, shutdown: &ShutdownManager) -> Result<()> {
        let worker_id = resolve_worker_id(&self.config.worker);
        let boot_id = new_boot_id();
        let channel = channel_for(&self.config.worker, &worker_id, &boot_id, Some(&self.broker))?;
        let service = Arc::new(WorkerService::new(
            self.config.worker.clone(),
            channel,
            worker_id,
            boot_id,
        ));

        let mut shutdown_rx = shutdown.subscribe();
        let handles = service.start(shutdown.sender()).await?;
        if !shutdown.is_shutdown() {
            let _ = shutdown_rx.recv().await;
        }
        info!("Worker {} 收到关闭信号，等待运行中的任务结束", service.worker_id());
        service.await_shutdown(handles).await;
        Ok(())
    }

    async fn run_gateway(&self, shutdown: &ShutdownManager) -> Result<()> {
        taskfleet_gateway::serve(&self.config.gateway, &self.broker, shutdown.subscribe()).await
    }
}

fn check_mode_enabled(config: &AppConfig, mode: AppMode) -> Result<()> {
    let enabled = match mode {
        AppMode::Dispatcher => config.dispatcher.enabled,
        AppMode::Worker => config.worker.enabled,
        AppMode::Gateway => config.gateway.enabled,
        AppMode::All => config.dispatcher.enabled && config.worker.enabled && config.gateway.enabled,
    };
    if !enabled {
        return Err(anyhow::anyhow!("{mode:?}模式在配置中被禁用"));
    }
    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "dispatcher".to_string())
}
