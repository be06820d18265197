use serde::{Deserialize, Serialize};

/// Worker认证方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    #[default]
    Hmac,
    Mtls,
}

/// 网关上登记的单个Worker凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCredential {
    pub worker_id: String,
    pub mode: AuthMode,
    /// API key 或 HMAC 密钥
    #[serde(default)]
    pub secret: Option<String>,
    /// mTLS模式下由TLS终结方写入的证书主题
    #[serde(default)]
    pub cert_subject: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global_rate_per_second: f64,
    pub global_burst: u32,
    pub per_worker_rate_per_second: f64,
    pub per_worker_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rate_per_second: 500.0,
            global_burst: 1_000,
            per_worker_rate_per_second: 20.0,
            per_worker_burst: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub timestamp_tolerance_seconds: u64,
    pub rate_limit: RateLimitConfig,
    pub credentials: Vec<WorkerCredential>,
    pub max_poll_count: usize,
    pub max_block_ms: u64,
    pub request_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8090".to_string(),
            timestamp_tolerance_seconds: 300,
            rate_limit: RateLimitConfig::default(),
            credentials: vec![],
            max_poll_count: 50,
            max_block_ms: 5_000,
            request_timeout_seconds: 30,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("网关绑定地址不能为空"));
        }

        if self.timestamp_tolerance_seconds == 0 {
            return Err(anyhow::anyhow!("时间戳容差必须大于0"));
        }

        let limits = &self.rate_limit;
        if limits.global_rate_per_second <= 0.0 || limits.per_worker_rate_per_second <= 0.0 {
            return Err(anyhow::anyhow!("限流速率必须大于0"));
        }
        if limits.global_burst == 0 || limits.per_worker_burst == 0 {
            return Err(anyhow::anyhow!("限流桶容量必须大于0"));
        }

        for credential in &self.credentials {
            match credential.mode {
                AuthMode::ApiKey | AuthMode::Hmac if credential.secret.is_none() => {
                    return Err(anyhow::anyhow!(
                        "Worker {} 的凭据缺少secret",
                        credential.worker_id
                    ));
                }
                AuthMode::Mtls if credential.cert_subject.is_none() => {
                    return Err(anyhow::anyhow!(
                        "Worker {} 的凭据缺少cert_subject",
                        credential.worker_id
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "json" 或 "pretty"
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }
        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.log_format));
        }
        Ok(())
    }
}
