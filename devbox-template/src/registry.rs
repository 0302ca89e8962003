//! The immutable action type -> handler table.

use std::collections::BTreeMap;
use std::sync::Arc;

use devbox_host::ServiceSupervisor;
use serde::{Deserialize, Serialize};

use crate::handler::ActionHandler;
use crate::handlers::{
    CompleteHandler, CreateDatabaseHandler, CreateDirectoryHandler, CreateServiceHandler,
    CreateVenvHandler, DatabaseSettings, GenerateSshKeyHandler, GitCloneHandler,
    InstallExtensionsHandler, InstallPackagesHandler, PipInstallHandler, RunScriptHandler,
    SetEnvVarsHandler, WriteConfigHandler,
};
use crate::model::ActionType;

/// Settings the built-in handlers need from the host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    pub editor_bin: String,
    pub database: DatabaseSettings,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            editor_bin: "code-server".to_string(),
            database: DatabaseSettings::default(),
        }
    }
}

/// Maps every action type to its handler. Built once and shared behind an `Arc`.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// The built-in handler for every action type.
    pub fn standard(supervisor: Arc<ServiceSupervisor>, settings: &HandlerSettings) -> Self {
        Self::builder()
            .register(GenerateSshKeyHandler)
            .register(GitCloneHandler)
            .register(InstallPackagesHandler)
            .register(CreateVenvHandler)
            .register(PipInstallHandler)
            .register(CreateDirectoryHandler)
            .register(WriteConfigHandler)
            .register(CreateDatabaseHandler::new(settings.database.clone()))
            .register(InstallExtensionsHandler::new(settings.editor_bin.clone()))
            .register(SetEnvVarsHandler)
            .register(RunScriptHandler)
            .register(CreateServiceHandler::new(supervisor))
            .register(CompleteHandler)
            .build()
    }

    pub fn get(&self, action_type: ActionType) -> Option<&dyn ActionHandler> {
        self.handlers.get(&action_type).map(|h| h.as_ref())
    }

    pub fn action_types(&self) -> impl Iterator<Item = ActionType> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("action_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: BTreeMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register `handler` for its action type, replacing any earlier registration.
    pub fn register(mut self, handler: impl ActionHandler + 'static) -> Self {
        self.handlers.insert(handler.action_type(), Arc::new(handler));
        self
    }

    pub fn register_arc(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(handler.action_type(), handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_core::fake::FakeSystem;

    #[test]
    fn test_standard_registry_is_complete() {
        let system = Arc::new(FakeSystem::new());
        let supervisor = Arc::new(ServiceSupervisor::new(system, "/etc/systemd/system"));
        let registry = HandlerRegistry::standard(supervisor, &HandlerSettings::default());

        assert_eq!(registry.len(), ActionType::ALL.len());
        for action_type in ActionType::ALL {
            let handler = registry.get(action_type).expect("handler registered");
            assert_eq!(handler.action_type(), action_type);
        }
    }

    #[test]
    fn test_builder_replaces() {
        let registry = HandlerRegistry::builder()
            .register(RunScriptHandler)
            .register(RunScriptHandler)
            .build();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(ActionType::GitClone).is_none());
    }
}
