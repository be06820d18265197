use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::{SchedulerError, SchedulerResult};

/// 指数退避参数
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// 随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Default::default()
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从1开始），不小于 `base`，不大于 `max`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = base * self.multiplier.powi(exponent);
        let capped = raw.min(self.max.as_secs_f64());
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let delay = (capped + jitter).clamp(base, self.max.as_secs_f64().max(base));
        Duration::from_secs_f64(delay)
    }
}

/// 对可重试错误做有限次数的本地退避重试
///
/// 只有 [`crate::SchedulerError::is_retryable`] 为真的错误会重试，
/// 其余错误立即返回。被限流时至少等待服务端给出的秒数。
pub async fn retry_with_backoff<T, F, Fut>(
    backoff: &Backoff,
    max_attempts: u32,
    operation: &str,
    mut f: F,
) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let mut delay = backoff.delay_for(attempt);
                if let SchedulerError::RateLimited { retry_after_seconds } = &e {
                    delay = delay.max(Duration::from_secs(*retry_after_seconds));
                }
                warn!(
                    "{} 失败 (第 {}/{} 次): {}，{:?} 后重试",
                    operation, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_is_capped() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(200), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.5,
        };
        for _ in 0..100 {
            let delay = backoff.delay_for(3);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_only_transport_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: SchedulerResult<u32> =
            retry_with_backoff(&Backoff::default(), 3, "xadd", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(SchedulerError::transport("connection reset"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: SchedulerResult<()> =
            retry_with_backoff(&Backoff::default(), 3, "xadd", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::LeadershipLost)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: SchedulerResult<()> =
            retry_with_backoff(&Backoff::default(), 4, "xack", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::transport("timeout"))
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_waits_for_retry_after() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = tokio::time::Instant::now();
        let result: SchedulerResult<u32> =
            retry_with_backoff(&Backoff::default(), 3, "publish", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SchedulerError::RateLimited { retry_after_seconds: 7 })
                } else {
                    Ok(1)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert!(started.elapsed() >= Duration::from_secs(7));
    }
}
