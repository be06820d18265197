//! 任务插件
//!
//! 插件只负责把任务参数翻译成声明式的 [`ExecutionPlan`]，不启动进程，
//! 也不访问网络。注册表按优先级从高到低尝试，第一个匹配的插件先做完整
//! 校验（收集所有错误），通过后才生成计划。

mod command;
mod common;
mod script;
mod shell;

pub use command::CommandPlugin;
pub use common::CommonParams;
pub use script::ScriptPlugin;
pub use shell::ShellPlugin;

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use taskfleet_core::models::{ExecutionPlan, ResourceLimits, SandboxPolicy, TaskReadyPayload};
use taskfleet_core::{SchedulerError, SchedulerResult};

/// 生成计划时可用的运行上下文
#[derive(Debug, Clone)]
pub struct PluginContext<'a> {
    pub execution_id: &'a str,
    pub task_id: i64,
    pub attempt: u32,
    /// 消息中携带的超时，0表示未设置
    pub timeout_seconds: u64,
    pub default_timeout: Duration,
    pub default_limits: &'a ResourceLimits,
    pub task_limits: Option<&'a ResourceLimits>,
    pub sandbox: &'a SandboxPolicy,
}

impl<'a> PluginContext<'a> {
    pub fn for_payload(
        payload: &'a TaskReadyPayload,
        default_timeout: Duration,
        default_limits: &'a ResourceLimits,
        sandbox: &'a SandboxPolicy,
    ) -> Self {
        Self {
            execution_id: &payload.execution_id,
            task_id: payload.task_id,
            attempt: payload.attempt,
            timeout_seconds: payload.timeout_seconds,
            default_timeout,
            default_limits,
            task_limits: payload.resource_limits.as_ref(),
            sandbox,
        }
    }
}

pub trait TaskPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// 数值越大越先尝试
    fn priority(&self) -> i32;

    fn matches(&self, params: &serde_json::Value) -> bool;

    /// 返回全部校验错误，空表示通过
    fn validate(&self, params: &serde_json::Value) -> Vec<String>;

    fn build_plan(&self, ctx: &PluginContext<'_>, params: &serde_json::Value) -> SchedulerResult<ExecutionPlan>;
}

pub struct PluginRegistry {
    plugins: Vec<Arc<dyn TaskPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// 内置的脚本、Shell和命令插件
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ScriptPlugin));
        registry.register(Arc::new(ShellPlugin));
        registry.register(Arc::new(CommandPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn TaskPlugin>) {
        self.plugins.push(plugin);
        // 稳定排序，同优先级按注册顺序
        self.plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn find(&self, params: &serde_json::Value) -> Option<&Arc<dyn TaskPlugin>> {
        self.plugins.iter().find(|p| p.matches(params))
    }

    /// 选择插件、校验参数并生成执行计划
    pub fn build_plan(&self, ctx: &PluginContext<'_>, params: &serde_json::Value) -> SchedulerResult<ExecutionPlan> {
        let plugin = self
            .find(params)
            .ok_or_else(|| SchedulerError::NoPluginMatched(summarize_keys(params)))?;
        debug!("执行实例 {} 使用插件 {}", ctx.execution_id, plugin.name());

        let errors = plugin.validate(params);
        if !errors.is_empty() {
            metrics::counter!("taskfleet_plugin_validation_failures_total", "plugin" => plugin.name())
                .increment(1);
            return Err(SchedulerError::PluginValidation(errors));
        }
        plugin.build_plan(ctx, params)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn summarize_keys(params: &serde_json::Value) -> String {
    match params.as_object() {
        Some(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("参数字段 [{}]", keys.join(", "))
        }
        None => format!("参数不是对象: {params}"),
    }
}
