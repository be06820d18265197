use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use taskfleet_core::config::LeaderConfig;
use taskfleet_core::models::{
    DispatchStatus, ExecutionStrategy, HeartbeatMessage, ResultMessage, RetryPolicy, ScheduleSpec,
    TaskDefinition, TaskStatus, TransportMode, WorkerStatus,
};
use taskfleet_core::traits::{TaskRunRepository, WorkerRegistry};
use taskfleet_core::SchedulerError;
use taskfleet_dispatcher::strategies::LoadBasedSelector;
use taskfleet_dispatcher::{ExecutionResolver, LeaderElection, TaskScheduler};
use taskfleet_infrastructure::{
    BrokerHandles, InMemoryLockBackend, InMemoryStreamQueue, InMemoryTaskRepository, InMemoryTaskRunRepository,
    InMemoryWorkerRegistry,
};

fn task(id: i64) -> TaskDefinition {
    TaskDefinition {
        id,
        project_id: 1,
        name: format!("task-{id}"),
        schedule: ScheduleSpec::Manual,
        execution_strategy: ExecutionStrategy::AutoSelect,
        bound_worker_id: None,
        failover_enabled: false,
        required_capabilities: vec![],
        params: serde_json::json!({"command": "true"}),
        priority: 5,
        timeout_seconds: 60,
        retry_policy: RetryPolicy::default(),
        resource_overrides: None,
        allow_overlap: true,
        status: TaskStatus::Active,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn heartbeat(worker_id: &str) -> HeartbeatMessage {
    HeartbeatMessage {
        worker_id: worker_id.to_string(),
        boot_id: "boot".to_string(),
        hostname: "localhost".to_string(),
        status: WorkerStatus::Online,
        transport: TransportMode::Direct,
        cpu_percent: 0.0,
        memory_percent: 0.0,
        disk_percent: 0.0,
        running_tasks: 0,
        max_concurrency: 4,
        version: "test".to_string(),
        os: "linux".to_string(),
        capabilities: BTreeMap::new(),
        resource_limits: Default::default(),
        timestamp: Utc::now(),
    }
}

struct Node {
    election: LeaderElection,
    scheduler: TaskScheduler,
}

fn node(
    id: &str,
    lock: &InMemoryLockBackend,
    tasks: &InMemoryTaskRepository,
    runs: &InMemoryTaskRunRepository,
    queue: &InMemoryStreamQueue,
    registry: &InMemoryWorkerRegistry,
) -> Node {
    let config = LeaderConfig {
        lock_key: "failover:leader".to_string(),
        ttl_seconds: 15,
        node_id: None,
    };
    let election = LeaderElection::new(Arc::new(lock.clone()), &config, id);
    let resolver = Arc::new(ExecutionResolver::new(
        Arc::new(registry.clone()),
        Arc::new(LoadBasedSelector::new()),
        20,
    ));
    let scheduler = TaskScheduler::new(
        Arc::new(tasks.clone()),
        Arc::new(runs.clone()),
        Arc::new(queue.clone()),
        resolver,
        election.handle(),
    );
    Node { election, scheduler }
}

#[tokio::test]
async fn test_deposed_leader_writes_are_fenced_out() {
    let lock = InMemoryLockBackend::new();
    let tasks = InMemoryTaskRepository::new();
    let runs = InMemoryTaskRunRepository::new();
    let queue = InMemoryStreamQueue::new();
    let registry = InMemoryWorkerRegistry::new();
    registry
        .record_heartbeat(&heartbeat("w1"), Duration::from_secs(30))
        .await
        .unwrap();
    tasks.upsert(task(1)).await;

    let a = node("node-a", &lock, &tasks, &runs, &queue, &registry);
    let b = node("node-b", &lock, &tasks, &runs, &queue, &registry);

    let first = a.election.try_acquire().await.unwrap().unwrap();
    assert!(b.election.try_acquire().await.unwrap().is_none());
    a.scheduler.trigger(1, None).await.unwrap();

    // A 的租约在它察觉之前过期，B 接任
    lock.expire_now("failover:leader").await;
    let second = b.election.try_acquire().await.unwrap().unwrap();
    assert!(second > first);
    b.scheduler.trigger(1, None).await.unwrap();

    // A 本地仍认为自己是Leader，但写入会被fencing拒绝
    assert!(a.election.handle().is_leader().await);
    let result = a.scheduler.trigger(1, None).await;
    assert!(matches!(result, Err(SchedulerError::StaleFencingToken { .. })));

    // 下一次续约发现锁已易主，立即降级
    assert!(!a.election.renew().await.unwrap());
    assert!(matches!(
        a.scheduler.trigger(1, None).await,
        Err(SchedulerError::LeadershipLost)
    ));
    assert_eq!(runs.list_by_task(1).await.len(), 2);
    assert_eq!(runs.max_fence().await, Some(second));
    assert!(runs.list_unfinished(Some(1)).await.unwrap().len() <= 2);
}

struct ProcessNode {
    election: LeaderElection,
    scheduler: TaskScheduler,
    broker: BrokerHandles,
}

/// 独立进程中的Dispatcher，只通过broker句柄共享状态
fn process_node(id: &str, broker: BrokerHandles, tasks: &InMemoryTaskRepository) -> ProcessNode {
    let config = LeaderConfig {
        lock_key: "failover:leader".to_string(),
        ttl_seconds: 15,
        node_id: Some(id.to_string()),
    };
    let election = LeaderElection::new(broker.lock.clone(), &config, config.resolve_node_id("localhost"));
    let resolver = Arc::new(ExecutionResolver::new(
        broker.registry.clone(),
        Arc::new(LoadBasedSelector::new()),
        20,
    ));
    let scheduler = TaskScheduler::new(
        Arc::new(tasks.clone()),
        broker.runs.clone(),
        broker.queue.clone(),
        resolver,
        election.handle(),
    );
    ProcessNode {
        election,
        scheduler,
        broker,
    }
}

#[tokio::test]
async fn test_new_leader_takes_over_runs_of_the_old_one() {
    let lock = InMemoryLockBackend::new();
    let broker = BrokerHandles {
        queue: Arc::new(InMemoryStreamQueue::new()),
        lock: Arc::new(lock.clone()),
        registry: Arc::new(InMemoryWorkerRegistry::new()),
        runs: Arc::new(InMemoryTaskRunRepository::new()),
    };
    broker
        .registry
        .record_heartbeat(&heartbeat("w1"), Duration::from_secs(30))
        .await
        .unwrap();
    let tasks = InMemoryTaskRepository::new();
    tasks.upsert(task(1)).await;

    let a = process_node("node-a", broker.clone(), &tasks);
    let b = process_node("node-b", broker.clone(), &tasks);

    let first = a.election.try_acquire().await.unwrap().unwrap();
    let run = a.scheduler.trigger(1, None).await.unwrap();
    assert_eq!(run.dispatch_status, DispatchStatus::Dispatched);

    lock.expire_now("failover:leader").await;
    let second = b.election.try_acquire().await.unwrap().unwrap();
    assert!(second > first);

    // B 能看到 A 创建的实例，并继续推进它
    let seen = b.broker.runs.get_run(&run.execution_id).await.unwrap().unwrap();
    assert_eq!(seen.worker_id.as_deref(), Some("w1"));
    let unfinished = b.broker.runs.list_unfinished(Some(1)).await.unwrap();
    assert_eq!(unfinished.len(), 1);
    let ack = ResultMessage::dispatch(&run.execution_id, DispatchStatus::Acked).with_worker("w1");
    assert!(b
        .broker
        .runs
        .apply_update(&ack, Some(second))
        .await
        .unwrap()
        .is_applied());

    // A 迟到的写入被拒绝，实例保持 B 写入后的状态
    let late = ResultMessage::dispatch(&run.execution_id, DispatchStatus::Timeout).from_dispatcher();
    let err = a.broker.runs.apply_update(&late, Some(first)).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::StaleFencingToken { presented, current }
            if presented == first.0 && current == second.0
    ));
    let stored = b.broker.runs.get_run(&run.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.dispatch_status, DispatchStatus::Acked);
}
