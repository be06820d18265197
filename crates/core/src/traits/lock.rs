use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::SchedulerResult;

/// 单调递增的领导权纪元
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 带TTL的租约锁
///
/// 新的获取成功时，同一个key上的fencing token严格递增；当前持有者
/// 重复获取只会延长租约并返回当前token。
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> SchedulerResult<Option<FencingToken>>;

    /// 仅当锁仍由 `owner` 持有时延长租约
    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> SchedulerResult<bool>;

    /// 仅当锁仍由 `owner` 持有时释放
    async fn release(&self, key: &str, owner: &str) -> SchedulerResult<bool>;
}
