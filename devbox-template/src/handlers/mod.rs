//! Built-in action handlers, one per [`ActionType`](crate::model::ActionType).
//!
//! Handlers check for existing state before acting and overwrite rather than append,
//! so an attempt can be retried after a transient failure. What each one created is
//! recorded as an [`Artifact`] and is all that `rollback` removes.

mod complete;
mod database;
mod env;
mod extensions;
mod files;
mod git;
mod packages;
mod python;
mod script;
mod service;
mod ssh;

use std::path::Path;

use tracing::warn;

pub use complete::CompleteHandler;
pub use database::{CreateDatabaseHandler, DatabaseSettings};
pub use env::SetEnvVarsHandler;
pub use extensions::InstallExtensionsHandler;
pub use files::{CreateDirectoryHandler, WriteConfigHandler};
pub use git::GitCloneHandler;
pub use packages::InstallPackagesHandler;
pub use python::{CreateVenvHandler, PipInstallHandler};
pub use script::RunScriptHandler;
pub use service::CreateServiceHandler;
pub use ssh::GenerateSshKeyHandler;

use crate::error::ActionError;
use crate::handler::{ActionContext, ActionResult, Artifact};

/// Undo the path artifacts of `result`, newest first.
pub(crate) fn remove_artifact_paths(
    ctx: &ActionContext<'_>,
    result: &ActionResult,
) -> Result<(), ActionError> {
    for artifact in result.artifacts.iter().rev() {
        match artifact {
            Artifact::Path { path } => ctx.remove_home_path(path)?,
            Artifact::ReplacedFile {
                path,
                previous,
                mode,
            } => ctx.write_home_file(path, previous, *mode)?,
            _ => {}
        }
    }
    Ok(())
}

/// Best-effort removal of something a failed attempt left half-created.
pub(crate) fn remove_partial(ctx: &ActionContext<'_>, path: &Path) {
    if let Err(e) = ctx.remove_home_path(path) {
        warn!(action_id = ctx.action_id, path = %path.display(), error = %e, "Failed to clean up partial result");
    }
}
