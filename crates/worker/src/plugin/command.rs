use taskfleet_core::models::ExecutionPlan;
use taskfleet_core::{SchedulerError, SchedulerResult};

use super::common::{required_str, string_list, CommonParams};
use super::{PluginContext, TaskPlugin};

/// 直接执行程序：`params.program` + `params.args`，不经过shell
pub struct CommandPlugin;

impl TaskPlugin for CommandPlugin {
    fn name(&self) -> &'static str {
        "command"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn matches(&self, params: &serde_json::Value) -> bool {
        params.get("program").is_some()
    }

    fn validate(&self, params: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        required_str(params, "program", &mut errors);
        string_list(params, "args", &mut errors);
        CommonParams::parse(params, &mut errors);
        errors
    }

    fn build_plan(&self, ctx: &PluginContext<'_>, params: &serde_json::Value) -> SchedulerResult<ExecutionPlan> {
        let mut errors = Vec::new();
        let program = required_str(params, "program", &mut errors).map(str::to_string);
        let args = string_list(params, "args", &mut errors);
        let common = CommonParams::parse(params, &mut errors);
        match program {
            Some(program) if errors.is_empty() => common.into_plan(ctx, self.name(), program, args),
            _ => Err(SchedulerError::PluginValidation(errors)),
        }
    }
}
