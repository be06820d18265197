//! 调度控制面
//!
//! Leader选举、执行解析、调度核心、结果消费、重试、对账与控制操作。

pub mod controller;
pub mod cron_utils;
pub mod leader;
pub mod reconciler;
pub mod resolver;
pub mod result_consumer;
pub mod retry_service;
pub mod scheduler;
pub mod service;
pub mod strategies;

#[cfg(test)]
mod test_utils;

pub use controller::{CancelOutcome, TaskController};
pub use leader::{LeaderElection, LeadershipHandle};
pub use resolver::{ExecutionResolver, Resolution};
pub use scheduler::{TaskScheduler, TriggerHandle};
pub use service::{DispatcherDeps, DispatcherService};
pub use strategies::{selector_from_name, WorkerSelector};
