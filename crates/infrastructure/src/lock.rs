//! 租约锁实现
//!
//! 每个锁key旁边维护一个只增不减的计数器 `{key}:fence`，新的持有者获取
//! 成功时递增计数器，计数器的当前值就是当前持有者的fencing token。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use taskfleet_core::traits::{FencingToken, LockBackend};
use taskfleet_core::SchedulerResult;

use crate::redis_stream::RedisConnectionManager;

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LockState {
    leases: HashMap<String, Lease>,
    fences: HashMap<String, u64>,
}

/// 进程内租约锁
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockBackend {
    state: Arc<Mutex<LockState>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试用：让某个key的租约立即过期
    pub async fn expire_now(&self, key: &str) {
        self.state.lock().await.leases.remove(key);
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> SchedulerResult<Option<FencingToken>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let held_by_other = state
            .leases
            .get(key)
            .is_some_and(|l| l.expires_at > now && l.owner != owner);
        if held_by_other {
            return Ok(None);
        }

        let reacquire = state
            .leases
            .get(key)
            .is_some_and(|l| l.expires_at > now && l.owner == owner);
        let token = if reacquire {
            state.fences.get(key).copied().unwrap_or(0)
        } else {
            let counter = state.fences.entry(key.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        state.leases.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(FencingToken(token)))
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.leases.get_mut(key) {
            Some(lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let owned = state
            .leases
            .get(key)
            .is_some_and(|l| l.owner == owner && l.expires_at > now);
        if owned {
            state.leases.remove(key);
        }
        Ok(owned)
    }
}

const ACQUIRE_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder == false then
  local token = redis.call('INCR', KEYS[2])
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return token
elseif holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return tonumber(redis.call('GET', KEYS[2]))
end
return false
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// 基于Redis的租约锁，所有判断在Lua脚本中原子完成
pub struct RedisLockBackend {
    connection_manager: Arc<RedisConnectionManager>,
}

impl RedisLockBackend {
    pub fn new(connection_manager: Arc<RedisConnectionManager>) -> Self {
        Self { connection_manager }
    }

    fn fence_key(key: &str) -> String {
        format!("{key}:fence")
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> SchedulerResult<Option<FencingToken>> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(ACQUIRE_SCRIPT)
            .arg(2)
            .arg(key)
            .arg(Self::fence_key(key))
            .arg(owner)
            .arg(ttl.as_millis() as u64);
        let token: Option<u64> = self.connection_manager.execute("lock_acquire", &cmd).await?;
        if let Some(token) = token {
            debug!("{} 持有锁 {}，fencing token {}", owner, key, token);
        }
        Ok(token.map(FencingToken))
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> SchedulerResult<bool> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(RENEW_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(owner)
            .arg(ttl.as_millis() as u64);
        let renewed: i64 = self.connection_manager.execute("lock_renew", &cmd).await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> SchedulerResult<bool> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(RELEASE_SCRIPT).arg(1).arg(key).arg(owner);
        let released: i64 = self.connection_manager.execute("lock_release", &cmd).await?;
        Ok(released == 1)
    }
}
