use std::path::Path;

use taskfleet_core::models::ExecutionPlan;
use taskfleet_core::{SchedulerError, SchedulerResult};

use super::common::{required_str, string_list, CommonParams};
use super::{PluginContext, TaskPlugin};

const DEFAULT_INTERPRETER: &str = "/bin/sh";

/// 内联脚本：`params.script` 交给 `params.interpreter` 执行，`params.args` 作为脚本参数
pub struct ScriptPlugin;

/// 解释器执行内联代码的参数
fn inline_flag(interpreter: &str) -> &'static str {
    let name = Path::new(interpreter)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(interpreter);
    match name {
        "node" | "nodejs" | "ruby" | "perl" => "-e",
        _ => "-c",
    }
}

impl ScriptPlugin {
    fn interpreter<'p>(params: &'p serde_json::Value, errors: &mut Vec<String>) -> &'p str {
        match params.get("interpreter") {
            None | Some(serde_json::Value::Null) => DEFAULT_INTERPRETER,
            Some(_) => required_str(params, "interpreter", errors).unwrap_or(DEFAULT_INTERPRETER),
        }
    }
}

impl TaskPlugin for ScriptPlugin {
    fn name(&self) -> &'static str {
        "script"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn matches(&self, params: &serde_json::Value) -> bool {
        params.get("script").is_some()
    }

    fn validate(&self, params: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        required_str(params, "script", &mut errors);
        Self::interpreter(params, &mut errors);
        string_list(params, "args", &mut errors);
        CommonParams::parse(params, &mut errors);
        errors
    }

    fn build_plan(&self, ctx: &PluginContext<'_>, params: &serde_json::Value) -> SchedulerResult<ExecutionPlan> {
        let mut errors = Vec::new();
        let script = required_str(params, "script", &mut errors).map(str::to_string);
        let interpreter = Self::interpreter(params, &mut errors).to_string();
        let script_args = string_list(params, "args", &mut errors);
        let common = CommonParams::parse(params, &mut errors);
        let Some(script) = script.filter(|_| errors.is_empty()) else {
            return Err(SchedulerError::PluginValidation(errors));
        };

        let mut args = vec![inline_flag(&interpreter).to_string(), script];
        if !script_args.is_empty() {
            // sh -c 的第一个位置参数是 $0
            if inline_flag(&interpreter) == "-c" && interpreter.ends_with("sh") {
                args.push("script".to_string());
            }
            args.extend(script_args);
        }
        common.into_plan(ctx, self.name(), interpreter, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::tests::Defaults;
    use serde_json::json;

    #[test]
    fn test_python_script_plan() {
        let defaults = Defaults::new();
        let plan = ScriptPlugin
            .build_plan(
                &defaults.ctx(),
                &json!({"script": "import sys; print(sys.argv)", "interpreter": "python3", "args": ["a", 1]}),
            )
            .unwrap();
        assert_eq!(plan.command, "python3");
        assert_eq!(plan.args, vec!["-c", "import sys; print(sys.argv)", "a", "1"]);
    }

    #[test]
    fn test_shell_script_args_start_at_dollar_one() {
        let defaults = Defaults::new();
        let plan = ScriptPlugin
            .build_plan(&defaults.ctx(), &json!({"script": "echo $1", "args": ["x"]}))
            .unwrap();
        assert_eq!(plan.command, "/bin/sh");
        assert_eq!(plan.args, vec!["-c", "echo $1", "script", "x"]);
    }

    #[test]
    fn test_node_uses_eval_flag() {
        assert_eq!(inline_flag("/usr/bin/node"), "-e");
        assert_eq!(inline_flag("bash"), "-c");
    }

    #[test]
    fn test_validation_errors() {
        let errors = ScriptPlugin.validate(&json!({"script": "", "interpreter": 3, "args": "x"}));
        assert_eq!(errors.len(), 3, "{errors:?}");
    }
}
