use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, RedisError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use taskfleet_core::config::BrokerConfig;
use taskfleet_core::{retry_with_backoff, Backoff, SchedulerError, SchedulerResult};

use super::metrics_collector::RedisStreamMetrics;

/// Redis连接管理
///
/// 基于 `redis::aio::ConnectionManager` 的多路复用连接，断线后自动重连；
/// 传输层错误按指数退避在本地重试。
#[derive(Clone)]
pub struct RedisConnectionManager {
    connection: ConnectionManager,
    backoff: Backoff,
    max_retry_attempts: u32,
    metrics: Arc<RedisStreamMetrics>,
}

/// 连接类错误可以重试，其余（如 NOGROUP、脚本错误）直接返回
pub(crate) fn map_redis_error(e: RedisError) -> SchedulerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        SchedulerError::Transport(format!("Redis连接错误: {e}"))
    } else {
        SchedulerError::Internal(format!("Redis命令失败: {e}"))
    }
}

impl RedisConnectionManager {
    pub async fn new(config: &BrokerConfig) -> SchedulerResult<Self> {
        let redis_url = config.redis.build_url();
        let client = Client::open(redis_url)
            .map_err(|e| SchedulerError::Configuration(format!("无法创建Redis客户端: {e}")))?;

        let timeout = Duration::from_secs(config.redis.connection_timeout_seconds);
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| SchedulerError::transport(format!("连接Redis超时 ({timeout:?})")))?
            .map_err(map_redis_error)?;

        let manager = Self {
            connection,
            backoff: Backoff::new(
                Duration::from_millis(config.retry_base_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            max_retry_attempts: config.max_retry_attempts,
            metrics: Arc::new(RedisStreamMetrics::default()),
        };
        manager.ping().await?;
        debug!(
            "已连接Redis {}:{}",
            config.redis.host, config.redis.port
        );
        Ok(manager)
    }

    pub fn metrics(&self) -> Arc<RedisStreamMetrics> {
        self.metrics.clone()
    }

    /// 执行单条命令，传输层错误自动重试
    pub async fn execute<T: FromRedisValue + Send>(&self, operation: &str, cmd: &redis::Cmd) -> SchedulerResult<T> {
        let started = std::time::Instant::now();
        let result = retry_with_backoff(&self.backoff, self.max_retry_attempts, operation, || {
            let cmd = cmd.clone();
            let mut connection = self.connection.clone();
            let metrics = self.metrics.clone();
            async move {
                cmd.query_async::<T>(&mut connection).await.map_err(|e| {
                    metrics.record_connection_error();
                    map_redis_error(e)
                })
            }
        })
        .await;
        self.metrics
            .record_operation_duration(operation, started.elapsed().as_millis() as f64);
        if let Err(e) = &result {
            if e.is_retryable() {
                error!("Redis操作 {} 重试 {} 次后仍失败: {}", operation, self.max_retry_attempts, e);
            }
        }
        result
    }

    /// 执行事务管道，所有命令的结果都被忽略
    pub async fn execute_pipeline(&self, operation: &str, pipe: &redis::Pipeline) -> SchedulerResult<()> {
        retry_with_backoff(&self.backoff, self.max_retry_attempts, operation, || {
            let pipe = pipe.clone();
            let mut connection = self.connection.clone();
            let metrics = self.metrics.clone();
            async move {
                pipe.query_async::<()>(&mut connection).await.map_err(|e| {
                    metrics.record_connection_error();
                    map_redis_error(e)
                })
            }
        })
        .await
    }

    pub async fn ping(&self) -> SchedulerResult<()> {
        let response: String = self.execute("ping", &redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(SchedulerError::transport(format!("意外的PING响应: {response}")))
        }
    }
}
