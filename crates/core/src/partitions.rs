//! 流分区与消费组命名

/// 所有Worker共享的控制分区
pub const GLOBAL_CONTROL: &str = "control:global";
/// Worker上报的状态结果
pub const RESULTS: &str = "results";
/// Worker上报的日志
pub const LOGS: &str = "logs";

/// 任务分区上的消费组
pub const WORKERS_GROUP: &str = "workers";
/// `results` / `logs` 上的消费组
pub const DISPATCHERS_GROUP: &str = "dispatchers";

pub fn tasks(worker_id: &str) -> String {
    format!("tasks:{worker_id}")
}

pub fn control(worker_id: &str) -> String {
    format!("control:{worker_id}")
}

/// 每个Worker在控制分区上独占一个消费组，全局控制消息因此会扇出到所有Worker
pub fn control_group(worker_id: &str) -> String {
    format!("control:{worker_id}")
}

pub fn reply(request_id: &str) -> String {
    format!("reply:{request_id}")
}

/// 消费者名称带上启动ID，重启后的进程可以认领上一个实例遗留的条目
pub fn worker_consumer(worker_id: &str, boot_id: &str) -> String {
    format!("{worker_id}:{boot_id}")
}

/// 从 `tasks:{worker_id}` 中取出Worker ID
pub fn worker_of_task_partition(partition: &str) -> Option<&str> {
    partition.strip_prefix("tasks:").filter(|id| !id.is_empty())
}
