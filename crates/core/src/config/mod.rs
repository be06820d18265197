mod broker;
mod control_plane;
mod gateway;
mod worker;

pub use broker::{BrokerBackend, BrokerConfig, RedisConfig};
pub use control_plane::{DispatcherConfig, LeaderConfig};
pub use gateway::{AuthMode, GatewayConfig, ObservabilityConfig, RateLimitConfig, WorkerCredential};
pub use worker::{WorkerAuthConfig, WorkerConfig};

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 系统配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub dispatcher: DispatcherConfig,
    pub leader: LeaderConfig,
    pub worker: WorkerConfig,
    pub gateway: GatewayConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置
    ///
    /// 加载顺序：
    /// 1. 内置默认值
    /// 2. 配置文件（TOML）
    /// 3. 环境变量覆盖（前缀 `TASKFLEET_`，层级分隔符 `__`，
    ///    例如 `TASKFLEET_WORKER__MAX_CONCURRENCY=8`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/taskfleet.toml", "taskfleet.toml", "/etc/taskfleet/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKFLEET")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("worker.capabilities")
                .with_list_parse_key("worker.env_allowlist")
                .with_list_parse_key("worker.wrapper")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate().context("broker配置验证失败")?;
        self.dispatcher.validate().context("Dispatcher配置验证失败")?;
        self.leader.validate().context("Leader配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.gateway.validate().context("网关配置验证失败")?;
        self.observability.validate().context("可观测性配置验证失败")?;
        Ok(())
    }
}
