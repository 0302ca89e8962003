//! Outbound notifications about provisioning outcomes.

use devbox_core::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::workspace::{CreateWorkspaceRequest, Workspace, WorkspaceStatus};

/// Emitted once per terminal outcome: `Active` or `Error` after provisioning, `Deleting`
/// once a workspace has been removed. A request rejected before a record existed is
/// reported as `Error` with an empty `workspace_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionEvent {
    pub workspace_id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: WorkspaceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ProvisionEvent {
    pub fn for_workspace(workspace: &Workspace, error_kind: Option<ErrorKind>) -> Self {
        Self {
            workspace_id: workspace.id.clone(),
            tenant_id: workspace.tenant_id.clone(),
            name: workspace.name.clone(),
            status: workspace.status,
            public_url: workspace.public_url.clone(),
            ssh_public_key: workspace.ssh_public_key.clone(),
            error_kind,
        }
    }

    pub fn rejected(request: &CreateWorkspaceRequest, error_kind: ErrorKind) -> Self {
        Self {
            workspace_id: String::new(),
            tenant_id: request.tenant_id.clone(),
            name: request.name.clone(),
            status: WorkspaceStatus::Error,
            public_url: None,
            ssh_public_key: None,
            error_kind: Some(error_kind),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProvisionEvent);
}

/// Logs events; the default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ProvisionEvent) {
        match event.error_kind {
            Some(kind) => warn!(
                workspace_id = %event.workspace_id,
                tenant_id = %event.tenant_id,
                name = %event.name,
                status = %event.status,
                error_kind = ?kind,
                "Provisioning event"
            ),
            None => info!(
                workspace_id = %event.workspace_id,
                status = %event.status,
                public_url = event.public_url.as_deref().unwrap_or_default(),
                "Provisioning event"
            ),
        }
    }
}

impl EventSink for UnboundedSender<ProvisionEvent> {
    fn emit(&self, event: ProvisionEvent) {
        if let Err(e) = self.send(event) {
            debug!(workspace_id = %e.0.workspace_id, "Event receiver dropped");
        }
    }
}
