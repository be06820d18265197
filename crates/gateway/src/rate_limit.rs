//! 两级限流：先检查全局配额，再检查Worker自己的配额
//!
//! 两级都是 `governor` 的GCRA限流器，全局一个直接限流器，Worker按ID
//! 共用一个键控限流器。

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::state::{InMemoryState, NotKeyed};
use governor::{NotUntil, Quota};
use serde::Serialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

use taskfleet_core::config::RateLimitConfig;

/// 超过这么多Worker的状态时清理已经回满的条目
const MAX_TRACKED_WORKERS: usize = 10_000;

type DirectLimiter<C> = governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;
type KeyedLimiter<C> =
    governor::RateLimiter<String, DefaultKeyedStateStore<String>, C, NoOpMiddleware<<C as Clock>::Instant>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Global,
    Worker,
}

/// 限流拒绝时返回给调用方的信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitRejection {
    pub scope: RateLimitScope,
    pub retry_after_seconds: u64,
    pub remaining: u64,
    pub limit: u64,
}

pub struct RateLimiter<C: Clock = DefaultClock> {
    global: DirectLimiter<C>,
    workers: KeyedLimiter<C>,
    global_burst: u32,
    per_worker_burst: u32,
    clock: C,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, DefaultClock::default())
    }
}

impl<C: Clock + Clone> RateLimiter<C> {
    pub fn with_clock(config: RateLimitConfig, clock: C) -> Self {
        let global = quota("global", config.global_rate_per_second, config.global_burst);
        let per_worker = quota("per_worker", config.per_worker_rate_per_second, config.per_worker_burst);
        Self {
            global: governor::RateLimiter::new(global, InMemoryState::default(), clock.clone()),
            workers: governor::RateLimiter::new(per_worker, DefaultKeyedStateStore::default(), clock.clone()),
            global_burst: config.global_burst,
            per_worker_burst: config.per_worker_burst,
            clock,
        }
    }

    pub fn check(&self, worker_id: &str) -> Result<(), RateLimitRejection> {
        if let Err(not_until) = self.global.check() {
            return Err(self.rejection(RateLimitScope::Global, &not_until, self.global_burst));
        }

        if self.workers.len() > MAX_TRACKED_WORKERS {
            self.workers.retain_recent();
        }
        self.workers
            .check_key(&worker_id.to_string())
            .map_err(|not_until| self.rejection(RateLimitScope::Worker, &not_until, self.per_worker_burst))
    }

    fn rejection(&self, scope: RateLimitScope, not_until: &NotUntil<C::Instant>, limit: u32) -> RateLimitRejection {
        let wait = not_until.wait_time_from(self.clock.now());
        RateLimitRejection {
            scope,
            retry_after_seconds: retry_after_seconds(wait),
            remaining: 0,
            limit: u64::from(limit),
        }
    }
}

/// 每秒 `rate` 个、突发 `burst` 个的配额；配置非法时退化为每秒 `burst` 个
fn quota(name: &str, rate: f64, burst: u32) -> Quota {
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    let period = Duration::try_from_secs_f64(1.0 / rate)
        .ok()
        .and_then(Quota::with_period);
    match period {
        Some(quota) => quota.allow_burst(burst),
        None => {
            warn!("{name} 限流速率 {rate} 无效，按每秒 {burst} 个处理");
            Quota::per_second(burst)
        }
    }
}

/// 向上取整，至少1秒
fn retry_after_seconds(wait: Duration) -> u64 {
    (wait.as_secs_f64().ceil() as u64).max(1)
}
