//! Workspace provisioning orchestration
//!
//! Ties the host layers together: the [`Provisioner`] drives a workspace through its
//! lifecycle against the port registry, reverse-proxy routes, OS accounts, systemd units
//! and templates; [`WorkspaceService`] exposes it to async callers. Records are kept by a
//! [`WorkspaceRepository`] and outcomes reported through an [`EventSink`].

pub mod config;
pub mod events;
pub mod provisioner;
pub mod repository;
pub mod service;
pub mod workspace;

pub use config::OrchestratorConfig;
pub use devbox_core::{ErrorKind, ProvisionError, Result};
pub use events::{EventSink, ProvisionEvent, TracingEventSink};
pub use provisioner::{Provisioner, StatusReport};
pub use repository::{FileWorkspaceRepository, InMemoryWorkspaceRepository, WorkspaceRepository};
pub use service::WorkspaceService;
pub use workspace::{CreateWorkspaceRequest, Workspace, WorkspaceStatus};
