use devbox_core::validation::validate_identifier;
use tracing::info;

use crate::error::ActionError;
use crate::handler::{is_templated, validate_params, ActionContext, ActionHandler, ActionResult, ParamSpec};
use crate::model::{ActionType, Params};

/// Installs editor extensions for the account.
pub struct InstallExtensionsHandler {
    editor_bin: String,
}

impl InstallExtensionsHandler {
    pub fn new(editor_bin: impl Into<String>) -> Self {
        Self {
            editor_bin: editor_bin.into(),
        }
    }
}

impl ActionHandler for InstallExtensionsHandler {
    fn action_type(&self) -> ActionType {
        ActionType::InstallExtensions
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::list("extensions")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("editor_bin")];
        PARAMS
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(extensions) = params.get("extensions").and_then(|v| v.as_array()) {
            for id in extensions.iter().filter_map(|e| e.as_str()) {
                if !is_templated(id) {
                    validate_identifier("extension", id)?;
                }
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let extensions = ctx.list_param("extensions")?;
        if extensions.is_empty() {
            return Ok(ActionResult::skipped("no extensions listed"));
        }
        let editor_bin = ctx
            .opt_str("editor_bin")?
            .unwrap_or_else(|| self.editor_bin.clone());

        // Already-installed extensions are reported as such by the editor, not as errors.
        for id in &extensions {
            validate_identifier("extension", id)?;
            ctx.run(
                &ctx.user_command(&editor_bin)
                    .arg("--install-extension")
                    .arg(id.as_str()),
            )?;
        }

        info!(count = extensions.len(), "Installed editor extensions");
        Ok(ActionResult::new())
    }
}
