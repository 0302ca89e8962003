use devbox_core::validation::validate_identifier;
use tracing::info;

use crate::error::ActionError;
use crate::handler::{is_templated, validate_params, ActionContext, ActionHandler, ActionResult, ParamSpec};
use crate::model::{ActionType, Params};

/// Installs system packages. Package managers are idempotent, so there is no rollback:
/// removing a package another workspace may rely on is worse than leaving it.
pub struct InstallPackagesHandler;

fn check_manager(manager: &str) -> Result<(), ActionError> {
    match manager {
        "apt" | "dnf" => Ok(()),
        other => Err(ActionError::invalid(format!(
            "unsupported package manager '{}' (expected apt or dnf)",
            other
        ))),
    }
}

impl ActionHandler for InstallPackagesHandler {
    fn action_type(&self) -> ActionType {
        ActionType::InstallPackages
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::list("packages")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("manager")];
        PARAMS
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(manager) = params.get("manager").and_then(|v| v.as_str()) {
            if !is_templated(manager) {
                check_manager(manager)?;
            }
        }
        if let Some(packages) = params.get("packages").and_then(|v| v.as_array()) {
            for package in packages.iter().filter_map(|p| p.as_str()) {
                if !is_templated(package) {
                    validate_identifier("package", package)?;
                }
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let packages = ctx.list_param("packages")?;
        if packages.is_empty() {
            return Ok(ActionResult::skipped("no packages listed"));
        }
        for package in &packages {
            validate_identifier("package", package)?;
        }

        let manager = ctx.opt_str("manager")?.unwrap_or_else(|| "apt".to_string());
        check_manager(&manager)?;
        let install = match manager.as_str() {
            "dnf" => ctx.root_command("dnf").args(["install", "-y"]),
            _ => ctx
                .root_command("apt-get")
                .args(["install", "-y", "--no-install-recommends"])
                .env("DEBIAN_FRONTEND", "noninteractive"),
        };
        ctx.run(&install.args(packages.iter().map(String::as_str)))?;

        info!(count = packages.len(), manager = %manager, "Installed packages");
        Ok(ActionResult::new())
    }
}
