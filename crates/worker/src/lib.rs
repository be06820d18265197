//! 任务执行节点
//!
//! 从专属任务分区拉取任务，经本地优先级队列调度到固定数量的执行槽，
//! 由插件把任务参数翻译为执行计划，在受限的子进程中运行并上报结果。

pub mod channel;
pub mod executor;
pub mod heartbeat;
pub mod local_scheduler;
pub mod plugin;
pub mod service;

pub use channel::{channel_for, DirectChannel, GatewayChannel, WorkerChannel};
pub use executor::{CancelToken, ExecutorSettings, ProcessExecutor};
pub use local_scheduler::{LocalScheduler, LocalSchedulerConfig};
pub use plugin::{PluginContext, PluginRegistry, TaskPlugin};
pub use service::{new_boot_id, resolve_worker_id, WorkerService};
