use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use taskfleet_core::models::{ExecutionPlan, ResourceLimits};
use taskfleet_core::SchedulerResult;

use super::PluginContext;

/// 所有内置插件共享的可选参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonParams {
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub limits: Option<ResourceLimits>,
    pub artifacts: Vec<String>,
}

impl CommonParams {
    /// 解析共享参数，错误追加到 `errors`
    pub fn parse(params: &serde_json::Value, errors: &mut Vec<String>) -> Self {
        let mut common = CommonParams::default();

        match params.get("env") {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::Object(map)) => {
                for (key, value) in map {
                    match value.as_str() {
                        Some(v) => {
                            common.env.insert(key.clone(), v.to_string());
                        }
                        None => errors.push(format!("env.{key} 必须是字符串")),
                    }
                }
            }
            Some(_) => errors.push("env 必须是对象".to_string()),
        }

        match params.get("working_dir") {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::String(dir)) if !dir.is_empty() => {
                common.working_dir = Some(PathBuf::from(dir));
            }
            Some(_) => errors.push("working_dir 必须是非空字符串".to_string()),
        }

        match params.get("timeout_seconds") {
            None | Some(serde_json::Value::Null) => {}
            Some(value) => match value.as_u64() {
                Some(secs) if secs > 0 => common.timeout_seconds = Some(secs),
                _ => errors.push("timeout_seconds 必须是正整数".to_string()),
            },
        }

        match params.get("limits") {
            None | Some(serde_json::Value::Null) => {}
            Some(value) => match serde_json::from_value::<ResourceLimits>(value.clone()) {
                Ok(limits) => common.limits = Some(limits),
                Err(e) => errors.push(format!("limits 格式错误: {e}")),
            },
        }

        match params.get("artifacts") {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    match item.as_str() {
                        Some(pattern) => match glob::Pattern::new(pattern) {
                            Ok(_) => common.artifacts.push(pattern.to_string()),
                            Err(e) => errors.push(format!("artifacts[{i}] 不是合法的glob: {e}")),
                        },
                        None => errors.push(format!("artifacts[{i}] 必须是字符串")),
                    }
                }
            }
            Some(_) => errors.push("artifacts 必须是字符串数组".to_string()),
        }

        common
    }

    /// 超时优先级：参数 > 任务消息 > Worker默认值
    pub fn timeout(&self, ctx: &PluginContext<'_>) -> Duration {
        match self.timeout_seconds {
            Some(secs) => Duration::from_secs(secs),
            None if ctx.timeout_seconds > 0 => Duration::from_secs(ctx.timeout_seconds),
            None => ctx.default_timeout,
        }
    }

    /// 限制按 Worker默认值 < 任务定义 < 参数 依次覆盖
    pub fn limits(&self, ctx: &PluginContext<'_>) -> ResourceLimits {
        let mut limits = ctx.default_limits.clone();
        if let Some(task) = ctx.task_limits {
            limits = limits.merged_with(task);
        }
        if let Some(own) = &self.limits {
            limits = limits.merged_with(own);
        }
        limits
    }

    pub fn into_plan(
        self,
        ctx: &PluginContext<'_>,
        plugin: &str,
        command: String,
        args: Vec<String>,
    ) -> SchedulerResult<ExecutionPlan> {
        let timeout = self.timeout(ctx);
        let limits = self.limits(ctx);
        let mut env = self.env;
        env.insert("TASKFLEET_EXECUTION_ID".to_string(), ctx.execution_id.to_string());
        env.insert("TASKFLEET_TASK_ID".to_string(), ctx.task_id.to_string());
        env.insert("TASKFLEET_ATTEMPT".to_string(), ctx.attempt.to_string());
        Ok(ExecutionPlan {
            execution_id: ctx.execution_id.to_string(),
            plugin: plugin.to_string(),
            command,
            args,
            env,
            working_dir: self.working_dir,
            timeout,
            limits,
            sandbox: ctx.sandbox.clone(),
            artifact_patterns: self.artifacts,
        })
    }
}

/// 读取字符串数组参数
pub(crate) fn string_list(params: &serde_json::Value, key: &str, errors: &mut Vec<String>) -> Vec<String> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => vec![],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => {
                    errors.push(format!("{key}[{i}] 必须是字符串"));
                    None
                }
            })
            .collect(),
        Some(_) => {
            errors.push(format!("{key} 必须是数组"));
            vec![]
        }
    }
}

/// 读取必填的非空字符串参数
pub(crate) fn required_str<'p>(params: &'p serde_json::Value, key: &str, errors: &mut Vec<String>) -> Option<&'p str> {
    match params.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(serde_json::Value::String(_)) => {
            errors.push(format!("{key} 不能为空"));
            None
        }
        Some(_) => {
            errors.push(format!("{key} 必须是字符串"));
            None
        }
        None => {
            errors.push(format!("缺少 {key}"));
            None
        }
    }
}
