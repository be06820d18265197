use taskfleet_core::models::ExecutionPlan;
use taskfleet_core::{SchedulerError, SchedulerResult};

use super::common::{required_str, CommonParams};
use super::{PluginContext, TaskPlugin};

const SHELL: &str = "/bin/sh";

/// `params.shell` 或 `params.command` 字符串，通过 `/bin/sh -c` 执行
pub struct ShellPlugin;

impl ShellPlugin {
    fn key(params: &serde_json::Value) -> &'static str {
        if params.get("shell").is_some() {
            "shell"
        } else {
            "command"
        }
    }
}

impl TaskPlugin for ShellPlugin {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn matches(&self, params: &serde_json::Value) -> bool {
        params.get("shell").is_some_and(|v| v.is_string()) || params.get("command").is_some_and(|v| v.is_string())
    }

    fn validate(&self, params: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        required_str(params, Self::key(params), &mut errors);
        CommonParams::parse(params, &mut errors);
        errors
    }

    fn build_plan(&self, ctx: &PluginContext<'_>, params: &serde_json::Value) -> SchedulerResult<ExecutionPlan> {
        let mut errors = Vec::new();
        let command = required_str(params, Self::key(params), &mut errors).map(str::to_string);
        let common = CommonParams::parse(params, &mut errors);
        match command {
            Some(command) if errors.is_empty() => {
                common.into_plan(ctx, self.name(), SHELL.to_string(), vec!["-c".to_string(), command])
            }
            _ => Err(SchedulerError::PluginValidation(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::tests::Defaults;
    use serde_json::json;

    #[test]
    fn test_command_string_runs_through_sh() {
        let defaults = Defaults::new();
        let plan = ShellPlugin
            .build_plan(&defaults.ctx(), &json!({"command": "echo hi | wc -c"}))
            .unwrap();
        assert_eq!(plan.command, "/bin/sh");
        assert_eq!(plan.args, vec!["-c", "echo hi | wc -c"]);
        assert_eq!(plan.plugin, "shell");
    }

    #[test]
    fn test_command_array_is_not_shell() {
        assert!(!ShellPlugin.matches(&json!({"command": ["ls", "-l"]})));
        assert!(ShellPlugin.matches(&json!({"shell": "ls"})));
    }
}
