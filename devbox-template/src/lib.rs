//! Templates and the engine that applies them to a workspace account.
//!
//! A [`Template`] is an ordered list of [`ActionDefinition`]s. The [`TemplateExecutor`]
//! resolves each action to an [`ActionHandler`] through an immutable
//! [`HandlerRegistry`], evaluates its condition, substitutes `${var}` placeholders from
//! the [`ExecutionContext`], retries with backoff and rolls back on fatal failure.

pub mod catalog;
pub mod condition;
pub mod context;
pub mod error;
pub mod executor;
pub mod handler;
pub mod handlers;
pub mod model;
pub mod registry;

pub use catalog::{DirectoryCatalog, InMemoryCatalog, TemplateCatalog};
pub use condition::Condition;
pub use context::ExecutionContext;
pub use error::ActionError;
pub use executor::{
    AccountTarget, ActionRecord, ActionState, ActionTimeouts, RollbackFailure, RunOutcome,
    TemplateExecutor, TemplateRunReport,
};
pub use handler::{ActionContext, ActionHandler, ActionResult, Artifact, ParamKind, ParamSpec};
pub use handlers::DatabaseSettings;
pub use model::{ActionDefinition, ActionType, Params, RetryPolicy, RollbackBehavior, Template};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, HandlerSettings};
