use tracing::{debug, info, warn};

use crate::error::ActionError;
use crate::handler::{
    is_templated, validate_params, ActionContext, ActionHandler, ActionResult, Artifact, ParamSpec,
};
use crate::handlers::{remove_artifact_paths, remove_partial};
use crate::model::{ActionType, Params};

/// `python3`, `python3.12` or an absolute interpreter path.
fn check_interpreter(python: &str) -> Result<(), ActionError> {
    let name = python.rsplit('/').next().unwrap_or_default();
    let valid = name.starts_with("python")
        && name[6..].chars().all(|c| c.is_ascii_digit() || c == '.')
        && (!python.contains('/') || python.starts_with('/'));
    if !valid {
        return Err(ActionError::invalid(format!("invalid python interpreter '{}'", python)));
    }
    Ok(())
}

/// pip requirement specifiers, e.g. `django>=4.2,<5` or `uvicorn[standard]`.
fn check_requirement(spec: &str) -> Result<(), ActionError> {
    let allowed = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '[' | ']' | ',' | '<' | '>' | '=' | '!' | '~' | '*' | '+')
    };
    if spec.is_empty() || spec.starts_with('-') || !spec.chars().all(allowed) {
        return Err(ActionError::invalid(format!("invalid requirement '{}'", spec)));
    }
    Ok(())
}

/// Creates a Python virtual environment owned by the account.
pub struct CreateVenvHandler;

impl ActionHandler for CreateVenvHandler {
    fn action_type(&self) -> ActionType {
        ActionType::CreateVenv
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("path")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("python")];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["venv_path"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(python) = params.get("python").and_then(|v| v.as_str()) {
            if !is_templated(python) {
                check_interpreter(python)?;
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let path = ctx.home_path("path")?;
        let python = ctx.opt_str("python")?.unwrap_or_else(|| "python3".to_string());
        check_interpreter(&python)?;
        let result = ActionResult::new().output("venv_path", path.to_string_lossy());

        if ctx.system.path_exists(&path.join("pyvenv.cfg")) {
            debug!(venv = %path.display(), "Virtualenv already exists");
            return Ok(result);
        }
        let created = !ctx.system.path_exists(&path);

        let venv = ctx
            .user_command(&python)
            .args(["-m", "venv"])
            .arg(path.to_string_lossy());
        if let Err(e) = ctx.run(&venv) {
            if created {
                remove_partial(ctx, &path);
            }
            return Err(e);
        }
        info!(venv = %path.display(), "Created virtualenv");

        Ok(if created {
            result.artifact(Artifact::Path { path })
        } else {
            result
        })
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        remove_artifact_paths(ctx, result)
    }
}

/// Installs packages into an existing virtualenv.
pub struct PipInstallHandler;

impl ActionHandler for PipInstallHandler {
    fn action_type(&self) -> ActionType {
        ActionType::PipInstall
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("venv")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("requirements"), ParamSpec::list("packages")];
        PARAMS
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if !params.contains_key("requirements") && !params.contains_key("packages") {
            return Err(ActionError::invalid(
                "one of 'requirements' or 'packages' is required",
            ));
        }
        if let Some(packages) = params.get("packages").and_then(|v| v.as_array()) {
            for package in packages.iter().filter_map(|p| p.as_str()) {
                if !is_templated(package) {
                    check_requirement(package)?;
                }
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let venv = ctx.home_path("venv")?;
        let requirements = ctx.opt_home_path("requirements")?;
        let packages = ctx.list_param("packages")?;
        for package in &packages {
            check_requirement(package)?;
        }

        let mut result = ActionResult::new();
        let requirements = match requirements {
            Some(path) if !ctx.system.path_exists(&path) => {
                let message = format!("requirements file {} not found", path.display());
                warn!(action_id = ctx.action_id, "{}; skipping", message);
                if packages.is_empty() {
                    return Ok(ActionResult::skipped(message));
                }
                result = result.warning(message);
                None
            }
            other => other,
        };
        if requirements.is_none() && packages.is_empty() {
            return Ok(ActionResult::skipped("nothing to install"));
        }

        if !ctx.system.path_exists(&venv.join("pyvenv.cfg")) {
            return Err(ActionError::failed(format!(
                "{} is not a virtualenv",
                venv.display()
            )));
        }

        let mut install = ctx
            .user_command(&venv.join("bin/pip").to_string_lossy())
            .args(["install", "--disable-pip-version-check", "--no-input"]);
        if let Some(requirements) = &requirements {
            install = install.arg("-r").arg(requirements.to_string_lossy());
        }
        ctx.run(&install.args(packages.iter().map(String::as_str)))?;

        info!(venv = %venv.display(), packages = packages.len(), "Installed Python packages");
        Ok(result)
    }
}
