use chrono::Utc;
use tracing::{info, warn};

use crate::error::ActionError;
use crate::handler::{ActionContext, ActionHandler, ActionResult, ParamSpec};
use crate::model::ActionType;

/// Marks the workspace as provisioned. Never fails the run.
pub struct CompleteHandler;

impl ActionHandler for CompleteHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Complete
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("message")];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["provisioned_at"]
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let now = Utc::now().to_rfc3339();
        let message = ctx.opt_str("message").ok().flatten().unwrap_or_default();
        let mut result = ActionResult::new().output("provisioned_at", now.clone());

        let marker_dir = ctx.home_dir.join(".devbox");
        let marker = marker_dir.join("provisioned");
        let content = format!("provisioned_at={}\nmessage={}\n", now, message.replace('\n', " "));
        let written = ctx.confine(&marker_dir).and_then(|dir| {
            ctx.system.create_dir_all(&dir)?;
            ctx.chown(&dir, false)?;
            ctx.write_home_file(&marker, &content, 0o644)
        });

        match written {
            Ok(()) => info!(username = ctx.username, message = %message, "Provisioning complete"),
            Err(e) => {
                warn!(username = ctx.username, error = %e, "Could not write provisioned marker");
                result = result.warning(format!("marker not written: {}", e));
            }
        }
        Ok(result)
    }
}
