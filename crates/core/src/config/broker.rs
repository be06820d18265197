use serde::{Deserialize, Serialize};

/// broker后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// 进程内实现，只适用于单进程 `all` 模式和测试
    #[default]
    Memory,
    Redis,
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 30,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Redis主机地址不能为空"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("Redis端口必须大于0"));
        }
        if self.database < 0 {
            return Err(anyhow::anyhow!("Redis数据库索引不能为负数"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Redis连接超时时间必须大于0"));
        }
        Ok(())
    }

    /// 构建Redis连接URL
    pub fn build_url(&self) -> String {
        let auth = if let Some(password) = &self.password {
            format!(":{password}@")
        } else {
            String::new()
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub redis: RedisConfig,
    /// 传输层错误的本地重试次数
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// `reply:{request_id}` 回复通道的存活时间
    pub reply_ttl_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            redis: RedisConfig::default(),
            max_retry_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            reply_ttl_seconds: 60,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == BrokerBackend::Redis {
            self.redis.validate()?;
        }
        if self.max_retry_attempts == 0 {
            return Err(anyhow::anyhow!("传输层最大重试次数必须大于0"));
        }
        if self.retry_base_delay_ms == 0 || self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(anyhow::anyhow!(
                "传输层重试延迟配置无效: base={}ms, max={}ms",
                self.retry_base_delay_ms,
                self.retry_max_delay_ms
            ));
        }
        if self.reply_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("回复通道存活时间必须大于0"));
        }
        Ok(())
    }
}
