use std::sync::Arc;

use devbox_host::{ServiceSupervisor, ServiceUnit};

use crate::error::ActionError;
use crate::handler::{validate_params, ActionContext, ActionHandler, ActionResult, Artifact, ParamSpec};
use crate::model::{ActionType, Params};

/// Installs and starts an extra supervised service for the account.
pub struct CreateServiceHandler {
    supervisor: Arc<ServiceSupervisor>,
}

impl CreateServiceHandler {
    pub fn new(supervisor: Arc<ServiceSupervisor>) -> Self {
        Self { supervisor }
    }
}

impl ActionHandler for CreateServiceHandler {
    fn action_type(&self) -> ActionType {
        ActionType::CreateService
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("name"), ParamSpec::string("command")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::string("workdir"),
            ParamSpec::map("environment"),
            ParamSpec::string("description"),
        ];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["service_unit"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let unit = ServiceUnit {
            username: ctx.username.to_string(),
            name: ctx.str_param("name")?,
            command: ctx.str_param("command")?,
            work_dir: ctx.opt_home_path("workdir")?,
            environment: ctx.map_param("environment")?,
            description: ctx.opt_str("description")?,
        };
        let unit_name = self.supervisor.install_service(&unit)?;
        Ok(ActionResult::new()
            .output("service_unit", unit_name)
            .artifact(Artifact::Service { name: unit.name }))
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        for artifact in &result.artifacts {
            if let Artifact::Service { name } = artifact {
                self.supervisor.remove_service(ctx.username, name)?;
            }
        }
        Ok(())
    }
}
