use tracing::{debug, info};

use crate::error::ActionError;
use crate::handler::{is_templated, validate_params, ActionContext, ActionHandler, ActionResult, ParamSpec};
use crate::model::{ActionType, Params};

const SHELLS: &[&str] = &["bash", "sh", "zsh"];

fn check_shell(shell: &str) -> Result<(), ActionError> {
    if SHELLS.contains(&shell) {
        return Ok(());
    }
    Err(ActionError::invalid(format!(
        "unsupported shell '{}' (expected one of {})",
        shell,
        SHELLS.join(", ")
    )))
}

/// Runs an inline shell script. Scripts are opaque, so there is nothing to roll back.
pub struct RunScriptHandler;

impl ActionHandler for RunScriptHandler {
    fn action_type(&self) -> ActionType {
        ActionType::RunScript
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("script")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::string("shell"),
            ParamSpec::string("workdir"),
            ParamSpec::bool("as_root"),
        ];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["script_output"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(shell) = params.get("shell").and_then(|v| v.as_str()) {
            if !is_templated(shell) {
                check_shell(shell)?;
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let script = ctx.str_param("script")?;
        let shell = ctx.opt_str("shell")?.unwrap_or_else(|| "bash".to_string());
        check_shell(&shell)?;
        let workdir = ctx
            .opt_home_path("workdir")?
            .unwrap_or_else(|| ctx.home_dir.to_path_buf());
        let as_root = ctx.opt_bool("as_root")?.unwrap_or(false);

        let flag = if shell == "sh" { "-c" } else { "-lc" };
        let base = if as_root {
            ctx.root_command(&shell)
        } else {
            ctx.user_command(&shell)
        };
        let spec = base
            .cwd(&workdir)
            .env("DEVBOX_USERNAME", ctx.username)
            .env("DEVBOX_HOME", ctx.home_dir.to_string_lossy())
            .arg(flag)
            .arg(script.as_str());

        let output = ctx.run(&spec)?;
        debug!(action_id = ctx.action_id, output = %output.trim_end(), "Script output");
        info!(action_id = ctx.action_id, as_root, "Ran script");

        let tail: Vec<&str> = output.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Ok(ActionResult::new().output("script_output", tail.join("\n")))
    }
}
