//! Async entry points over the blocking [`Provisioner`].
//!
//! Every call runs on tokio's blocking pool so account, systemd and file operations never
//! stall the runtime. Different workspaces proceed in parallel.

use std::sync::Arc;

use devbox_core::{ProvisionError, Result};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::provisioner::{Provisioner, StatusReport};
use crate::workspace::{CreateWorkspaceRequest, Workspace};

#[derive(Clone)]
pub struct WorkspaceService {
    provisioner: Arc<Provisioner>,
}

impl WorkspaceService {
    pub fn new(provisioner: Provisioner) -> Self {
        Self {
            provisioner: Arc::new(provisioner),
        }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Provisioner) -> Result<T> + Send + 'static,
    {
        let provisioner = self.provisioner.clone();
        tokio::task::spawn_blocking(move || op(&provisioner))
            .await
            .map_err(|e| ProvisionError::Service(format!("Provisioning task failed: {}", e)))?
    }

    pub async fn provision_workspace(&self, request: CreateWorkspaceRequest) -> Result<Workspace> {
        self.blocking(move |p| p.provision(&request)).await
    }

    pub async fn deprovision_workspace(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |p| p.deprovision(&id)).await
    }

    pub async fn start_workspace(&self, id: &str) -> Result<Workspace> {
        let id = id.to_string();
        self.blocking(move |p| p.start(&id)).await
    }

    pub async fn stop_workspace(&self, id: &str) -> Result<Workspace> {
        let id = id.to_string();
        self.blocking(move |p| p.stop(&id)).await
    }

    pub async fn restart_workspace(&self, id: &str) -> Result<Workspace> {
        let id = id.to_string();
        self.blocking(move |p| p.restart(&id)).await
    }

    pub async fn get_status(&self, id: &str) -> Result<StatusReport> {
        let id = id.to_string();
        self.blocking(move |p| p.status(&id)).await
    }

    pub async fn get_logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        let id = id.to_string();
        self.blocking(move |p| p.logs(&id, lines)).await
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.blocking(|p| p.list_workspaces()).await
    }

    pub async fn reconcile(&self) -> Result<usize> {
        self.blocking(|p| p.reconcile()).await
    }

    /// Reconcile every `period` until the task is dropped. Failures are logged and the
    /// loop keeps going.
    pub async fn run_reconciler(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "Reconciler running");

        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                error!(error = %e, "Reconcile pass failed");
            }
        }
    }
}
