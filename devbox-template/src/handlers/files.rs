use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::ActionError;
use crate::handler::{
    is_templated, validate_params, ActionContext, ActionHandler, ActionResult, Artifact, ParamSpec,
};
use crate::handlers::remove_artifact_paths;
use crate::model::{ActionType, Params};

/// Parse an octal permission string such as `755` or `0640`.
fn parse_mode(mode: &str) -> Result<u32, ActionError> {
    let valid = (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c));
    if !valid {
        return Err(ActionError::invalid(format!("invalid mode '{}'", mode)));
    }
    u32::from_str_radix(mode, 8).map_err(|_| ActionError::invalid(format!("invalid mode '{}'", mode)))
}

fn check_mode_param(params: &Params) -> Result<(), ActionError> {
    match params.get("mode") {
        Some(serde_json::Value::String(mode)) if !is_templated(mode) => parse_mode(mode).map(|_| ()),
        Some(serde_json::Value::Number(n)) => parse_mode(&n.to_string()).map(|_| ()),
        _ => Ok(()),
    }
}

/// The outermost missing ancestor of `path` below `home`; removing it undoes a `mkdir -p`.
fn first_missing_ancestor(ctx: &ActionContext<'_>, path: &Path) -> Option<PathBuf> {
    let mut first = None;
    for ancestor in path.ancestors() {
        if !ancestor.starts_with(ctx.home_dir) || ancestor == ctx.home_dir {
            break;
        }
        if ctx.system.path_exists(ancestor) {
            break;
        }
        first = Some(ancestor.to_path_buf());
    }
    first
}

/// Creates a directory owned by the account.
pub struct CreateDirectoryHandler;

impl ActionHandler for CreateDirectoryHandler {
    fn action_type(&self) -> ActionType {
        ActionType::CreateDirectory
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("path")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("mode")];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["directory"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        check_mode_param(params)
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let path = ctx.home_path("path")?;
        let mode = ctx.opt_str("mode")?.unwrap_or_else(|| "755".to_string());
        parse_mode(&mode)?;
        let result = ActionResult::new().output("directory", path.to_string_lossy());

        let Some(created_root) = first_missing_ancestor(ctx, &path) else {
            debug!(path = %path.display(), "Directory already exists");
            return Ok(result);
        };

        // Running as the account makes every created level owned by it.
        ctx.run(
            &ctx.user_command("install")
                .args(["-d", "-m", mode.as_str()])
                .arg(path.to_string_lossy()),
        )?;
        info!(path = %path.display(), mode = %mode, "Created directory");
        Ok(result.artifact(Artifact::Path { path: created_root }))
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        remove_artifact_paths(ctx, result)
    }
}

/// Writes a file owned by the account. The content is substituted like any parameter.
pub struct WriteConfigHandler;

impl ActionHandler for WriteConfigHandler {
    fn action_type(&self) -> ActionType {
        ActionType::WriteConfig
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("path"), ParamSpec::string("content")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("mode")];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["config_path"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        check_mode_param(params)
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let path = ctx.home_path("path")?;
        if path == ctx.home_dir {
            return Err(ActionError::invalid("path must name a file"));
        }
        let content = ctx.str_param("content")?;
        let mode = parse_mode(&ctx.opt_str("mode")?.unwrap_or_else(|| "644".to_string()))?;

        let real = ctx.confine(&path)?;
        let previous = ctx.system.read_file(&real)?;
        let previous_mode = ctx.system.file_mode(&real)?;
        let mut result = ActionResult::new().output("config_path", path.to_string_lossy());

        if let Some(parent) = path.parent() {
            if let Some(created_root) = first_missing_ancestor(ctx, parent) {
                ctx.run(
                    &ctx.user_command("mkdir")
                        .arg("-p")
                        .arg(parent.to_string_lossy()),
                )?;
                result = result.artifact(Artifact::Path { path: created_root });
            }
        }

        ctx.write_home_file(&path, &content, mode)?;

        result = result.artifact(match (previous, previous_mode) {
            (Some(previous), Some(mode)) => Artifact::ReplacedFile {
                path: path.clone(),
                previous,
                mode,
            },
            _ => Artifact::Path { path: path.clone() },
        });
        info!(path = %path.display(), "Wrote config file");
        Ok(result)
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        remove_artifact_paths(ctx, result)
    }
}
