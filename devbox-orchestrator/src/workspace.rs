use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use devbox_core::{ProvisionError, Result};
use devbox_host::ResourceLimits;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One tenant's development environment and the host resources it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub hostname: String,
    pub username: String,
    /// Editor port; `None` until allocated and after release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Password protecting the editor.
    #[serde(default)]
    pub auth_secret: String,
    pub status: WorkspaceStatus,
    #[serde(default)]
    pub disk_quota_gb: u32,
    /// Whether the disk quota is actually enforced on the host.
    #[serde(default)]
    pub quota_enforced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// Extra units installed by the template, removed on deprovision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_units: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped_at: Option<DateTime<Utc>>,
}

/// Lifecycle status.
///
/// ```text
/// Pending -> Provisioning -> Active | Error
/// Active <-> Stopping <-> Stopped <-> Starting <-> Active
/// any -> Deleting -> (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Pending,
    Provisioning,
    Active,
    Stopping,
    Stopped,
    Starting,
    Error,
    Deleting,
}

impl WorkspaceStatus {
    pub fn can_transition_to(self, next: WorkspaceStatus) -> bool {
        use WorkspaceStatus::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Provisioning, Active)
                | (Provisioning, Error)
                | (Active, Stopping)
                | (Stopping, Active)
                | (Stopping, Stopped)
                | (Stopped, Stopping)
                | (Stopped, Starting)
                | (Starting, Stopped)
                | (Starting, Active)
                | (Active, Starting)
                | (_, Deleting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Provisioning => "provisioning",
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Stopping => "stopping",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Starting => "starting",
            WorkspaceStatus::Error => "error",
            WorkspaceStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Workspace {
    /// A new `Pending` workspace with a fresh id.
    pub fn new(
        request: &CreateWorkspaceRequest,
        username: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            name: request.name.clone(),
            hostname: hostname.into(),
            username: username.into(),
            port: None,
            auth_secret: String::new(),
            status: WorkspaceStatus::Pending,
            disk_quota_gb: request.disk_quota_gb,
            quota_enforced: false,
            template_id: request.template_id.clone(),
            limits: request.limits,
            is_running: false,
            public_url: None,
            ssh_public_key: None,
            service_units: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            last_started_at: None,
            last_stopped_at: None,
        }
    }

    /// Move to `next`, or fail with `InvalidState` if the state machine forbids it.
    pub fn transition(&mut self, next: WorkspaceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProvisionError::InvalidState(format!(
                "workspace {} cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.is_running = true;
        self.last_started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_stopped(&mut self) {
        let now = Utc::now();
        self.is_running = false;
        self.last_stopped_at = Some(now);
        self.updated_at = now;
    }
}

/// Input to `provision`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub template_id: Option<String>,
    /// Disk quota in GB; 0 means unlimited.
    #[serde(default)]
    pub disk_quota_gb: u32,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Extra template variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl CreateWorkspaceRequest {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn disk_quota_gb(mut self, gb: u32) -> Self {
        self.disk_quota_gb = gb;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}
