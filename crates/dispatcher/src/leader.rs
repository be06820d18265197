//! Leader选举
//!
//! 通过 [`LockBackend`] 上的租约互斥调度角色。后台循环每 `ttl/3` 续约一次，
//! 续约失败或出错时立即降级，而不是等待租约过期。Leader专属的循环在每个
//! 工作单元之前调用 [`LeadershipHandle::check`]，拿到的fencing token随写入
//! 一起提交。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use taskfleet_core::config::LeaderConfig;
use taskfleet_core::traits::{FencingToken, LockBackend};
use taskfleet_core::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy)]
struct Term {
    token: FencingToken,
    confirmed_at: Instant,
}

/// 当前节点的领导权视图，可在各个循环之间廉价克隆
#[derive(Debug, Clone)]
pub struct LeadershipHandle {
    term: Arc<RwLock<Option<Term>>>,
    /// 最后一次确认领导权之后，超过该时长即视为失去领导权
    deadline: Duration,
}

impl LeadershipHandle {
    fn new(deadline: Duration) -> Self {
        Self {
            term: Arc::new(RwLock::new(None)),
            deadline,
        }
    }

    /// 仅用于不需要选举的场景（测试、单进程嵌入）
    pub fn fixed(token: FencingToken) -> Self {
        Self {
            term: Arc::new(RwLock::new(Some(Term {
                token,
                confirmed_at: Instant::now(),
            }))),
            deadline: Duration::MAX,
        }
    }

    /// 返回当前有效的fencing token，否则返回 `LeadershipLost`
    ///
    /// 即使续约循环卡住没有主动降级，超过本地截止时间后这里也会失败。
    pub async fn check(&self) -> SchedulerResult<FencingToken> {
        match *self.term.read().await {
            Some(term) if term.confirmed_at.elapsed() <= self.deadline => Ok(term.token),
            _ => Err(SchedulerError::LeadershipLost),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.check().await.is_ok()
    }

    async fn confirm(&self, token: FencingToken) {
        *self.term.write().await = Some(Term {
            token,
            confirmed_at: Instant::now(),
        });
    }

    async fn demote(&self) -> Option<FencingToken> {
        self.term.write().await.take().map(|t| t.token)
    }
}

pub struct LeaderElection {
    lock: Arc<dyn LockBackend>,
    lock_key: String,
    node_id: String,
    ttl: Duration,
    handle: LeadershipHandle,
}

impl LeaderElection {
    pub fn new(lock: Arc<dyn LockBackend>, config: &LeaderConfig, node_id: impl Into<String>) -> Self {
        let ttl = Duration::from_secs(config.ttl_seconds);
        Self {
            lock,
            lock_key: config.lock_key.clone(),
            node_id: node_id.into(),
            ttl,
            handle: LeadershipHandle::new(ttl - ttl / 3),
        }
    }

    pub fn handle(&self) -> LeadershipHandle {
        self.handle.clone()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn renew_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// 尝试成为Leader；已经是Leader时等价于续约
    pub async fn try_acquire(&self) -> SchedulerResult<Option<FencingToken>> {
        let acquired = self
            .lock
            .try_acquire(&self.lock_key, &self.node_id, self.ttl)
            .await?;
        match acquired {
            Some(token) => {
                let previous = self.handle.check().await.ok();
                self.handle.confirm(token).await;
                if previous != Some(token) {
                    info!("节点 {} 成为Leader，fencing token {}", self.node_id, token);
                    metrics::counter!("taskfleet_leader_acquired_total").increment(1);
                }
                Ok(Some(token))
            }
            None => {
                debug!("Leader锁 {} 由其他节点持有", self.lock_key);
                Ok(None)
            }
        }
    }

    /// 续约；锁已不再归自己所有或续约出错时立即降级
    pub async fn renew(&self) -> SchedulerResult<bool> {
        let token = match self.handle.term.read().await.as_ref() {
            Some(term) => term.token,
            None => return Ok(false),
        };
        match self.lock.renew(&self.lock_key, &self.node_id, self.ttl).await {
            Ok(true) => {
                self.handle.confirm(token).await;
                Ok(true)
            }
            Ok(false) => {
                warn!("节点 {} 续约失败，锁已不再归属自己，立即降级", self.node_id);
                self.demote().await;
                Ok(false)
            }
            Err(e) => {
                error!("节点 {} 续约出错，立即降级: {}", self.node_id, e);
                self.demote().await;
                Err(e)
            }
        }
    }

    /// 主动放弃领导权
    pub async fn step_down(&self) -> SchedulerResult<()> {
        if let Some(token) = self.handle.demote().await {
            metrics::counter!("taskfleet_leader_lost_total").increment(1);
            info!("节点 {} 的任期 {} 结束", self.node_id, token);
            let released = self.lock.release(&self.lock_key, &self.node_id).await?;
            info!("节点 {} 主动放弃领导权 (释放锁: {})", self.node_id, released);
        }
        Ok(())
    }

    async fn demote(&self) {
        if let Some(token) = self.handle.demote().await {
            info!("节点 {} 的任期 {} 结束", self.node_id, token);
            metrics::counter!("taskfleet_leader_lost_total").increment(1);
        }
    }

    /// 选举循环：非Leader时尝试获取，Leader时续约；收到关闭信号后放弃领导权
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.renew_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = if self.handle.is_leader().await {
                        self.renew().await.map(|_| ())
                    } else {
                        // 本地截止时间已过但尚未降级的情况也在这里收敛
                        self.demote().await;
                        self.try_acquire().await.map(|_| ())
                    };
                    if let Err(e) = result {
                        warn!("Leader选举循环出错: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    if let Err(e) = self.step_down().await {
                        warn!("放弃领导权失败: {}", e);
                    }
                    info!("Leader选举循环已停止");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskfleet_infrastructure::InMemoryLockBackend;

    fn config() -> LeaderConfig {
        LeaderConfig {
            lock_key: "test:leader".to_string(),
            ttl_seconds: 15,
            node_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_leader() {
        let lock = Arc::new(InMemoryLockBackend::new());
        let a = LeaderElection::new(lock.clone(), &config(), "a");
        let b = LeaderElection::new(lock.clone(), &config(), "b");

        let token = a.try_acquire().await.unwrap().unwrap();
        assert!(b.try_acquire().await.unwrap().is_none());
        assert_eq!(a.handle().check().await.unwrap(), token);
        assert!(matches!(
            b.handle().check().await,
            Err(SchedulerError::LeadershipLost)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_demotes_immediately() {
        let lock = Arc::new(InMemoryLockBackend::new());
        let a = LeaderElection::new(lock.clone(), &config(), "a");
        let b = LeaderElection::new(lock.clone(), &config(), "b");
        let first = a.try_acquire().await.unwrap().unwrap();

        // 锁被别人接管
        lock.expire_now("test:leader").await;
        let second = b.try_acquire().await.unwrap().unwrap();
        assert!(second > first);

        assert!(!a.renew().await.unwrap());
        assert!(!a.handle().is_leader().await);
        assert_eq!(b.handle().check().await.unwrap(), second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_fails_after_local_deadline() {
        let lock = Arc::new(InMemoryLockBackend::new());
        let a = LeaderElection::new(lock, &config(), "a");
        a.try_acquire().await.unwrap().unwrap();
        let handle = a.handle();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(handle.is_leader().await);
        // ttl - ttl/3 = 10秒内没有成功续约
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!handle.is_leader().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_down_releases_lock() {
        let lock = Arc::new(InMemoryLockBackend::new());
        let a = LeaderElection::new(lock.clone(), &config(), "a");
        let b = LeaderElection::new(lock.clone(), &config(), "b");
        a.try_acquire().await.unwrap().unwrap();
        a.step_down().await.unwrap();
        assert!(!a.handle().is_leader().await);
        assert!(b.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_keeps_lease_and_steps_down() {
        let lock = Arc::new(InMemoryLockBackend::new());
        let election = Arc::new(LeaderElection::new(lock.clone(), &config(), "a"));
        let handle = election.handle();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(election.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_leader().await);
        // 跨越多个TTL仍保持领导权
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(handle.is_leader().await);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(!handle.is_leader().await);
        let other = LeaderElection::new(lock, &config(), "b");
        assert!(other.try_acquire().await.unwrap().is_some());
    }
}
