//! 执行解析：决定一次运行由哪个Worker执行
//!
//! 运行级覆盖优先于任务定义，默认 AUTO_SELECT。宣告某个Worker不可用之前
//! 一定先同步探测一次存活键，不直接相信可能过时的缓存状态。

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use taskfleet_core::models::{
    ExecutionStrategy, RunOverrides, TaskDefinition, WorkerNode, WorkerStatus,
};
use taskfleet_core::traits::WorkerRegistry;
use taskfleet_core::{SchedulerError, SchedulerResult};

use crate::strategies::WorkerSelector;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub worker_id: String,
    pub strategy: ExecutionStrategy,
    /// PREFER_BOUND 回退到了自动选择
    pub fell_back: bool,
}

pub struct ExecutionResolver {
    registry: Arc<dyn WorkerRegistry>,
    selector: Arc<dyn WorkerSelector>,
    stale_after_seconds: i64,
}

impl ExecutionResolver {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        selector: Arc<dyn WorkerSelector>,
        stale_after_seconds: u64,
    ) -> Self {
        Self {
            registry,
            selector,
            stale_after_seconds: stale_after_seconds as i64,
        }
    }

    pub async fn resolve(
        &self,
        task: &TaskDefinition,
        overrides: Option<&RunOverrides>,
    ) -> SchedulerResult<Resolution> {
        let strategy = task.effective_strategy(overrides);
        debug!("任务 {} 使用执行策略 {}", task.id, strategy);

        let resolution = match strategy {
            ExecutionStrategy::FixedWorker => {
                let worker_id = task.bound_worker_id.as_deref().ok_or_else(|| {
                    SchedulerError::Configuration(format!("任务 {} 使用FIXED_WORKER策略但没有绑定Worker", task.id))
                })?;
                self.ensure_available(worker_id).await?;
                Resolution {
                    worker_id: worker_id.to_string(),
                    strategy,
                    fell_back: false,
                }
            }
            ExecutionStrategy::Specified => {
                let worker_id = overrides
                    .and_then(|o| o.worker_id.as_deref())
                    .ok_or_else(|| {
                        SchedulerError::Configuration(format!("任务 {} 使用SPECIFIED策略但本次运行没有指定Worker", task.id))
                    })?;
                self.ensure_available(worker_id).await?;
                Resolution {
                    worker_id: worker_id.to_string(),
                    strategy,
                    fell_back: false,
                }
            }
            ExecutionStrategy::AutoSelect => {
                let node = self.auto_select(task, None).await?;
                Resolution {
                    worker_id: node.id,
                    strategy,
                    fell_back: false,
                }
            }
            ExecutionStrategy::PreferBound => self.prefer_bound(task).await?,
        };

        metrics::counter!("taskfleet_resolutions_total", "strategy" => strategy.to_string()).increment(1);
        Ok(resolution)
    }

    async fn prefer_bound(&self, task: &TaskDefinition) -> SchedulerResult<Resolution> {
        let strategy = ExecutionStrategy::PreferBound;
        let Some(bound) = task.bound_worker_id.as_deref() else {
            // 没有绑定Worker时等同于自动选择
            let node = self.auto_select(task, None).await?;
            return Ok(Resolution {
                worker_id: node.id,
                strategy,
                fell_back: true,
            });
        };

        match self.ensure_available(bound).await {
            Ok(_) => Ok(Resolution {
                worker_id: bound.to_string(),
                strategy,
                fell_back: false,
            }),
            Err(e @ SchedulerError::WorkerUnavailable { .. }) => {
                if !task.failover_enabled {
                    return Err(e);
                }
                warn!("任务 {} 的绑定Worker {} 不可用，回退到自动选择: {}", task.id, bound, e);
                let node = self.auto_select(task, Some(bound)).await?;
                info!("任务 {} 回退选择Worker {}", task.id, node.id);
                Ok(Resolution {
                    worker_id: node.id,
                    strategy,
                    fell_back: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn is_stale(&self, node: &WorkerNode) -> bool {
        node.is_heartbeat_expired(self.stale_after_seconds, Utc::now())
    }

    /// 确认指定Worker可以接收任务
    ///
    /// Worker自己上报的 draining/offline 状态直接判为不可用；缓存心跳过时
    /// 则同步探测存活键。
    async fn ensure_available(&self, worker_id: &str) -> SchedulerResult<WorkerNode> {
        let unavailable = |reason: &str| SchedulerError::WorkerUnavailable {
            worker_id: worker_id.to_string(),
            reason: reason.to_string(),
        };

        let node = self
            .registry
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| unavailable("未注册"))?;
        match node.status {
            WorkerStatus::Online => {}
            WorkerStatus::Draining => return Err(unavailable("正在排空")),
            WorkerStatus::Offline => return Err(unavailable("已下线")),
        }
        if self.is_stale(&node) {
            if !self.registry.probe(worker_id).await? {
                return Err(unavailable("心跳已过期"));
            }
            debug!("Worker {} 缓存心跳过时但探测存活", worker_id);
        }
        Ok(node)
    }

    /// 在所有在线且具备所需能力的Worker中选择一个
    async fn auto_select(&self, task: &TaskDefinition, exclude: Option<&str>) -> SchedulerResult<WorkerNode> {
        let mut candidates = Vec::new();
        for node in self.registry.list_workers().await? {
            if exclude == Some(node.id.as_str())
                || !node.is_online()
                || !node.has_capabilities(&task.required_capabilities)
            {
                continue;
            }
            if self.is_stale(&node) && !self.registry.probe(&node.id).await? {
                debug!("跳过心跳过期的Worker {}", node.id);
                continue;
            }
            candidates.push(node);
        }

        let selected = self.selector.select(&candidates).cloned().ok_or_else(|| {
            SchedulerError::NoEligibleWorker(format!(
                "任务 {} 需要能力 {:?}，没有在线Worker满足条件",
                task.id, task.required_capabilities
            ))
        })?;
        debug!(
            "{} 选择器从 {} 个候选中选择了 {}",
            self.selector.name(),
            candidates.len(),
            selected.id
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::LoadBasedSelector;
    use crate::test_utils::{heartbeat, task_definition};
    use std::time::Duration;
    use taskfleet_infrastructure::InMemoryWorkerRegistry;

    const TTL: Duration = Duration::from_secs(30);

    async fn resolver_with(workers: &[(&str, u32, &[&str])]) -> (ExecutionResolver, InMemoryWorkerRegistry) {
        let registry = InMemoryWorkerRegistry::new();
        for (id, running, caps) in workers {
            let mut hb = heartbeat(id);
            hb.running_tasks = *running;
            for cap in caps.iter() {
                hb.capabilities.insert(cap.to_string(), serde_json::Value::Bool(true));
            }
            registry.record_heartbeat(&hb, TTL).await.unwrap();
        }
        let resolver = ExecutionResolver::new(
            Arc::new(registry.clone()),
            Arc::new(LoadBasedSelector::new()),
            20,
        );
        (resolver, registry)
    }

    #[tokio::test]
    async fn test_fixed_worker_offline_fails_without_fallback() {
        let (resolver, registry) = resolver_with(&[("bound", 0, &[]), ("other", 0, &[])]).await;
        registry.remove_worker("bound").await.unwrap();

        let mut task = task_definition(1);
        task.execution_strategy = ExecutionStrategy::FixedWorker;
        task.bound_worker_id = Some("bound".to_string());
        task.failover_enabled = true;

        let err = resolver.resolve(&task, None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerUnavailable { ref worker_id, .. } if worker_id == "bound"));
    }

    #[tokio::test]
    async fn test_prefer_bound_falls_back_excluding_bound() {
        let (resolver, registry) = resolver_with(&[("bound", 0, &[]), ("other", 3, &[])]).await;
        // 绑定Worker最空闲，但已离线
        let mut stale = WorkerNode::from_heartbeat(&heartbeat("bound"));
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        registry.upsert_stale(stale).await;

        let mut task = task_definition(1);
        task.execution_strategy = ExecutionStrategy::PreferBound;
        task.bound_worker_id = Some("bound".to_string());
        task.failover_enabled = true;

        let resolution = resolver.resolve(&task, None).await.unwrap();
        assert_eq!(resolution.worker_id, "other");
        assert!(resolution.fell_back);

        task.failover_enabled = false;
        assert!(matches!(
            resolver.resolve(&task, None).await,
            Err(SchedulerError::WorkerUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_cache_is_probed_before_failing() {
        let (resolver, registry) = resolver_with(&[("bound", 0, &[])]).await;
        // 缓存的心跳时间很旧，但存活键仍在
        let mut hb = heartbeat("bound");
        hb.timestamp = Utc::now() - chrono::Duration::seconds(120);
        registry.record_heartbeat(&hb, TTL).await.unwrap();

        let mut task = task_definition(1);
        task.execution_strategy = ExecutionStrategy::FixedWorker;
        task.bound_worker_id = Some("bound".to_string());
        assert_eq!(resolver.resolve(&task, None).await.unwrap().worker_id, "bound");
    }

    #[tokio::test]
    async fn test_auto_select_filters_capabilities() {
        let (resolver, _) = resolver_with(&[("plain", 0, &[]), ("browser", 2, &["browser"])]).await;
        let mut task = task_definition(1);
        task.required_capabilities = vec!["browser".to_string()];
        assert_eq!(resolver.resolve(&task, None).await.unwrap().worker_id, "browser");

        task.required_capabilities = vec!["gpu".to_string()];
        assert!(matches!(
            resolver.resolve(&task, None).await,
            Err(SchedulerError::NoEligibleWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_run_override_takes_precedence() {
        let (resolver, _) = resolver_with(&[("w1", 0, &[]), ("w2", 3, &[])]).await;
        let task = task_definition(1);
        let overrides = RunOverrides {
            strategy: Some(ExecutionStrategy::Specified),
            worker_id: Some("w2".to_string()),
            ..Default::default()
        };
        let resolution = resolver.resolve(&task, Some(&overrides)).await.unwrap();
        assert_eq!(resolution.worker_id, "w2");
        assert_eq!(resolution.strategy, ExecutionStrategy::Specified);

        let missing = RunOverrides {
            strategy: Some(ExecutionStrategy::Specified),
            ..Default::default()
        };
        assert!(resolver.resolve(&task, Some(&missing)).await.is_err());
    }

    #[tokio::test]
    async fn test_draining_worker_is_unavailable() {
        let (resolver, registry) = resolver_with(&[("w1", 0, &[])]).await;
        let mut hb = heartbeat("w1");
        hb.status = WorkerStatus::Draining;
        registry.record_heartbeat(&hb, TTL).await.unwrap();

        let mut task = task_definition(1);
        task.execution_strategy = ExecutionStrategy::FixedWorker;
        task.bound_worker_id = Some("w1".to_string());
        assert!(matches!(
            resolver.resolve(&task, None).await,
            Err(SchedulerError::WorkerUnavailable { .. })
        ));
        // 自动选择同样跳过排空中的Worker
        task.execution_strategy = ExecutionStrategy::AutoSelect;
        assert!(resolver.resolve(&task, None).await.is_err());
    }
}
