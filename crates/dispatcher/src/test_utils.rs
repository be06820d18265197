use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use taskfleet_core::models::{
    ExecutionStrategy, HeartbeatMessage, RetryPolicy, ScheduleSpec, TaskDefinition, TaskStatus,
    TransportMode, WorkerNode, WorkerStatus,
};
use taskfleet_core::traits::{FencingToken, WorkerRegistry};
use taskfleet_infrastructure::{
    InMemoryStreamQueue, InMemoryTaskRepository, InMemoryTaskRunRepository, InMemoryWorkerRegistry,
};

use crate::leader::LeadershipHandle;
use crate::resolver::ExecutionResolver;
use crate::scheduler::TaskScheduler;
use crate::strategies::LoadBasedSelector;

pub fn task_definition(id: i64) -> TaskDefinition {
    TaskDefinition {
        id,
        project_id: 1,
        name: format!("task-{id}"),
        schedule: ScheduleSpec::Manual,
        execution_strategy: ExecutionStrategy::AutoSelect,
        bound_worker_id: None,
        failover_enabled: false,
        required_capabilities: vec![],
        params: serde_json::json!({"command": "echo hello"}),
        priority: 5,
        timeout_seconds: 60,
        retry_policy: RetryPolicy::default(),
        resource_overrides: None,
        allow_overlap: false,
        status: TaskStatus::Active,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn heartbeat(worker_id: &str) -> HeartbeatMessage {
    HeartbeatMessage {
        worker_id: worker_id.to_string(),
        boot_id: "boot-1".to_string(),
        hostname: format!("{worker_id}.local"),
        status: WorkerStatus::Online,
        transport: TransportMode::Direct,
        cpu_percent: 10.0,
        memory_percent: 20.0,
        disk_percent: 30.0,
        running_tasks: 0,
        max_concurrency: 4,
        version: "0.1.0".to_string(),
        os: "linux".to_string(),
        capabilities: BTreeMap::new(),
        resource_limits: Default::default(),
        timestamp: Utc::now(),
    }
}

pub fn worker_node(id: &str, running: u32, max: u32) -> WorkerNode {
    let mut hb = heartbeat(id);
    hb.running_tasks = running;
    hb.max_concurrency = max;
    WorkerNode::from_heartbeat(&hb)
}

/// 内存实现组装出的调度环境，当前节点以固定token作为Leader
pub struct Fixture {
    pub tasks: InMemoryTaskRepository,
    pub runs: InMemoryTaskRunRepository,
    pub queue: InMemoryStreamQueue,
    pub registry: InMemoryWorkerRegistry,
    pub leadership: LeadershipHandle,
    pub fence: FencingToken,
    pub resolver: Arc<ExecutionResolver>,
    pub scheduler: Arc<TaskScheduler>,
}

impl Fixture {
    pub async fn with_workers(worker_ids: &[&str]) -> Self {
        let registry = InMemoryWorkerRegistry::new();
        for id in worker_ids {
            registry
                .record_heartbeat(&heartbeat(id), Duration::from_secs(30))
                .await
                .unwrap();
        }
        let tasks = InMemoryTaskRepository::new();
        let runs = InMemoryTaskRunRepository::new();
        let queue = InMemoryStreamQueue::new();
        let fence = FencingToken(5);
        let leadership = LeadershipHandle::fixed(fence);
        let resolver = Arc::new(ExecutionResolver::new(
            Arc::new(registry.clone()),
            Arc::new(LoadBasedSelector::new()),
            20,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(tasks.clone()),
            Arc::new(runs.clone()),
            Arc::new(queue.clone()),
            resolver.clone(),
            leadership.clone(),
        ));
        Self {
            tasks,
            runs,
            queue,
            registry,
            leadership,
            fence,
            resolver,
            scheduler,
        }
    }
}
