use tracing::{debug, info};

use crate::error::ActionError;
use crate::handler::{
    is_templated, validate_params, ActionContext, ActionHandler, ActionResult, Artifact, ParamSpec,
};
use crate::handlers::{remove_artifact_paths, remove_partial};
use crate::model::{ActionType, Params};

/// Clones a repository into the account's home.
pub struct GitCloneHandler;

/// Accept https, ssh and scp-style URLs; anything else (`ext::`, `file://`, options) is refused.
fn check_url(url: &str) -> Result<(), ActionError> {
    let scp_style = url.starts_with("git@") && url.contains(':');
    let allowed = url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("ssh://")
        || scp_style;
    if !allowed || url.chars().any(char::is_whitespace) {
        return Err(ActionError::invalid(format!("unsupported repository URL '{}'", url)));
    }
    Ok(())
}

fn check_branch(branch: &str) -> Result<(), ActionError> {
    let valid = !branch.starts_with('-')
        && !branch.contains("..")
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if !valid {
        return Err(ActionError::invalid(format!("invalid branch name '{}'", branch)));
    }
    Ok(())
}

impl ActionHandler for GitCloneHandler {
    fn action_type(&self) -> ActionType {
        ActionType::GitClone
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("url"), ParamSpec::string("dest")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::string("branch"),
            ParamSpec::integer("depth"),
            ParamSpec::bool("full_history"),
        ];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["repo_path"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(url) = params.get("url").and_then(|v| v.as_str()) {
            if !is_templated(url) {
                check_url(url)?;
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let url = ctx.str_param("url")?;
        check_url(&url)?;
        let dest = ctx.home_path("dest")?;
        let result = ActionResult::new().output("repo_path", dest.to_string_lossy());

        if ctx.system.path_exists(&dest.join(".git")) {
            debug!(dest = %dest.display(), "Repository already cloned");
            return Ok(result);
        }
        let created = !ctx.system.path_exists(&dest);

        let mut clone = ctx.user_command("git").arg("clone");
        if !ctx.opt_bool("full_history")?.unwrap_or(false) {
            let depth = ctx.opt_u64("depth")?.unwrap_or(1).max(1);
            clone = clone.arg("--depth").arg(depth.to_string());
        }
        if let Some(branch) = ctx.opt_str("branch")? {
            check_branch(&branch)?;
            clone = clone.arg("--branch").arg(branch);
        }
        clone = clone.arg("--").arg(url.as_str()).arg(dest.to_string_lossy());

        let is_ssh = url.starts_with("git@") || url.starts_with("ssh://");
        if is_ssh {
            if let Some(key) = ctx.vars.get("ssh_key_path") {
                clone = clone.env(
                    "GIT_SSH_COMMAND",
                    format!(
                        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                        key
                    ),
                );
            }
        }

        if let Err(e) = ctx.run(&clone) {
            if created {
                remove_partial(ctx, &dest);
            }
            return Err(e);
        }
        info!(url = %url, dest = %dest.display(), "Cloned repository");

        Ok(if created {
            result.artifact(Artifact::Path { path: dest })
        } else {
            result
        })
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        remove_artifact_paths(ctx, result)
    }
}
