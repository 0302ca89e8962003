//! Workspace lifecycle: provisioning, teardown and service control.
//!
//! Provisioning allocates a port and credentials, creates the OS account, installs and
//! starts the editor, applies the template, sets the disk quota and publishes the route.
//! A failure in any step except the quota undoes the completed steps and leaves the
//! workspace in `Error` with a one-line reason.

// Standard library
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

// External crates
use devbox_core::validation::{
    derive_hostname, derive_username, validate_hostname, validate_username, MAX_LABEL_LEN,
    MAX_USERNAME_LEN,
};
use devbox_core::{secrets, HostSystem, ProvisionError, Result, System};
use devbox_host::{AccountManager, EditorService, ServiceState, ServiceSupervisor};
use devbox_ports::PortAllocator;
use devbox_proxy::RouteManager;
use devbox_template::{
    AccountTarget, ActionState, ActionType, DirectoryCatalog, ExecutionContext, HandlerRegistry,
    Template, TemplateCatalog, TemplateExecutor,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

// Internal imports
use crate::config::OrchestratorConfig;
use crate::events::{EventSink, ProvisionEvent, TracingEventSink};
use crate::repository::{FileWorkspaceRepository, WorkspaceRepository};
use crate::workspace::{CreateWorkspaceRequest, Workspace, WorkspaceStatus};

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Workspace record plus what the supervisor currently reports for its editor.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub workspace: Workspace,
    /// `None` when the workspace holds no host resources.
    pub service: Option<ServiceState>,
}

/// Steps of a provisioning run that have touched the host.
#[derive(Debug, Default)]
struct Progress {
    port: Option<u16>,
    account_created: bool,
    editor_installed: bool,
    route_attempted: bool,
}

/// One mutex per workspace id. Lifecycle calls and reconcile hold it while they read,
/// act on and save a record.
#[derive(Default)]
struct WorkspaceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkspaceLocks {
    fn with<T>(&self, id: &str, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        op()
    }

    fn forget(&self, id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

pub struct Provisioner {
    config: OrchestratorConfig,
    ports: PortAllocator,
    routes: RouteManager,
    accounts: AccountManager,
    supervisor: Arc<ServiceSupervisor>,
    executor: TemplateExecutor,
    catalog: Arc<dyn TemplateCatalog>,
    repository: Arc<dyn WorkspaceRepository>,
    events: Arc<dyn EventSink>,
    locks: WorkspaceLocks,
}

impl Provisioner {
    pub fn new(
        config: OrchestratorConfig,
        system: Arc<dyn System>,
        repository: Arc<dyn WorkspaceRepository>,
        catalog: Arc<dyn TemplateCatalog>,
    ) -> Result<Self> {
        config.validate()?;
        let ports = PortAllocator::open(config.port_registry_path(), config.port_range)?;
        let routes = RouteManager::new(&config.route_config_path, config.route_settings());
        let accounts = AccountManager::new(system.clone(), &config.home_root);
        let supervisor = Arc::new(
            ServiceSupervisor::new(system.clone(), &config.unit_dir)
                .with_editor_bin(&config.editor_bin),
        );
        let registry = HandlerRegistry::standard(supervisor.clone(), &config.handler_settings());
        let executor = TemplateExecutor::new(Arc::new(registry), system)
            .with_timeouts(config.action_timeouts());

        Ok(Self {
            config,
            ports,
            routes,
            accounts,
            supervisor,
            executor,
            catalog,
            repository,
            events: Arc::new(TracingEventSink),
            locks: WorkspaceLocks::default(),
        })
    }

    /// The host-backed wiring: real commands, YAML state in `state_dir`, templates
    /// from `template_dir`.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let repository = Arc::new(FileWorkspaceRepository::open(config.workspace_state_path())?);
        let catalog = Arc::new(DirectoryCatalog::new(&config.template_dir));
        Self::new(config, Arc::new(HostSystem::new()), repository, catalog)
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn workspace(&self, id: &str) -> Result<Workspace> {
        self.repository
            .load_workspace(id)?
            .ok_or_else(|| ProvisionError::NotFound(id.to_string()))
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.repository.list_workspaces()
    }

    #[instrument(skip_all, fields(tenant_id = %request.tenant_id, name = %request.name))]
    pub fn provision(&self, request: &CreateWorkspaceRequest) -> Result<Workspace> {
        let (mut workspace, template) = match self.admit(request) {
            Ok(admitted) => admitted,
            Err(err) => {
                warn!(error = %err, "Provisioning request rejected");
                self.events.emit(ProvisionEvent::rejected(request, err.kind()));
                return Err(err);
            }
        };
        let id = workspace.id.clone();
        self.locks
            .with(&id, || self.provision_admitted(&mut workspace, request, template.as_ref()))
    }

    /// Resolve the template and a unique identity, then persist the `Provisioning` record.
    fn admit(&self, request: &CreateWorkspaceRequest) -> Result<(Workspace, Option<Template>)> {
        let template = request
            .template_id
            .as_deref()
            .map(|id| self.catalog.load_template(id))
            .transpose()?;
        let (username, hostname) = self.unique_identity(request)?;

        let mut workspace = Workspace::new(request, username, hostname);
        workspace.transition(WorkspaceStatus::Provisioning)?;
        self.repository.save_workspace(&workspace)?;
        Ok((workspace, template))
    }

    fn provision_admitted(
        &self,
        workspace: &mut Workspace,
        request: &CreateWorkspaceRequest,
        template: Option<&Template>,
    ) -> Result<Workspace> {
        info!(
            workspace_id = %workspace.id,
            username = %workspace.username,
            hostname = %workspace.hostname,
            "Provisioning workspace"
        );

        let mut progress = Progress::default();
        let outcome = self
            .provision_resources(workspace, request, template, &mut progress)
            .and_then(|()| {
                workspace.transition(WorkspaceStatus::Active)?;
                workspace.mark_running();
                self.repository.save_workspace(workspace)
            });

        match outcome {
            Ok(()) => {
                info!(
                    workspace_id = %workspace.id,
                    port = ?workspace.port,
                    public_url = workspace.public_url.as_deref().unwrap_or_default(),
                    quota_enforced = workspace.quota_enforced,
                    "Workspace active"
                );
                self.events
                    .emit(ProvisionEvent::for_workspace(workspace, None));
                Ok(workspace.clone())
            }
            Err(err) => {
                self.cleanup_failed_workspace(workspace, &progress, &err);
                self.events
                    .emit(ProvisionEvent::for_workspace(workspace, Some(err.kind())));
                Err(err)
            }
        }
    }

    fn provision_resources(
        &self,
        workspace: &mut Workspace,
        request: &CreateWorkspaceRequest,
        template: Option<&Template>,
        progress: &mut Progress,
    ) -> Result<()> {
        let port = self.ports.allocate(&workspace.id)?;
        progress.port = Some(port);
        workspace.port = Some(port);
        workspace.auth_secret = secrets::generate(self.config.password_length);
        workspace.public_url = Some(RouteManager::public_url(&workspace.hostname));
        let account_password = secrets::generate(self.config.password_length);
        self.repository.save_workspace(workspace)?;

        self.accounts
            .create_account(&workspace.username, &account_password)?;
        progress.account_created = true;
        let home_dir = self.accounts.home_dir(&workspace.username);

        let editor = EditorService {
            username: workspace.username.clone(),
            port,
            auth_secret: workspace.auth_secret.clone(),
            work_dir: home_dir.clone(),
            open_path: None,
            limits: workspace.limits,
        };
        progress.editor_installed = true;
        self.supervisor.install_editor_service(&editor)?;
        self.supervisor
            .start(&workspace.username)
            .map_err(|e| service_install(&editor, e))?;

        if let Some(template) = template {
            self.apply_template(workspace, request, template, &home_dir, &editor)?;
        }

        if workspace.disk_quota_gb > 0 {
            workspace.quota_enforced = match self
                .accounts
                .apply_disk_quota(&workspace.username, workspace.disk_quota_gb)
            {
                Ok(enforced) => enforced,
                Err(e) => {
                    warn!(workspace_id = %workspace.id, error = %e, "Continuing without disk quota");
                    false
                }
            };
        }

        progress.route_attempted = true;
        let url = self.routes.add_route(&workspace.hostname, port)?;
        workspace.public_url = Some(url);
        Ok(())
    }

    fn apply_template(
        &self,
        workspace: &mut Workspace,
        request: &CreateWorkspaceRequest,
        template: &Template,
        home_dir: &Path,
        editor: &EditorService,
    ) -> Result<()> {
        let mut seed = ExecutionContext::new()
            .with("workspace_id", workspace.id.as_str())
            .with("workspace_name", workspace.name.as_str())
            .with("tenant_id", workspace.tenant_id.as_str())
            .with("username", workspace.username.as_str())
            .with("home_dir", home_dir.to_string_lossy())
            .with("hostname", workspace.hostname.as_str())
            .with("port", editor.port.to_string())
            .with(
                "public_url",
                workspace.public_url.clone().unwrap_or_default(),
            );
        seed.insert_secret("auth_secret", workspace.auth_secret.as_str());
        seed.insert_secret("db_password", secrets::generate(self.config.password_length));
        for (key, value) in &request.variables {
            if seed.contains(key) {
                warn!(variable = %key, "Ignoring caller variable that shadows a built-in");
                continue;
            }
            seed.insert(key.as_str(), value.as_str());
        }

        let target = AccountTarget {
            username: workspace.username.clone(),
            home_dir: home_dir.to_path_buf(),
        };
        let report = self.executor.run(template, &target, seed)?;
        for (action_id, warning) in report.warnings() {
            warn!(workspace_id = %workspace.id, action_id, warning, "Template warning");
        }

        workspace.service_units = report
            .actions
            .iter()
            .filter(|r| r.action_type == ActionType::CreateService && r.state == ActionState::Succeeded)
            .filter_map(|r| r.outputs.get("service_unit").cloned())
            .collect();
        if let Some(err) = report.error() {
            return Err(err);
        }
        workspace.ssh_public_key = report.context.get("ssh_public_key").map(str::to_string);

        if let Some(file) = report.workspace_file {
            let editor = EditorService {
                open_path: Some(file),
                ..editor.clone()
            };
            self.supervisor.install_editor_service(&editor)?;
            self.supervisor
                .restart(&workspace.username)
                .map_err(|e| service_install(&editor, e))?;
            debug!(workspace_id = %workspace.id, "Editor reopened on the template workspace file");
        }
        Ok(())
    }

    /// Undo whatever `progress` says was done and record the failure. Every step is
    /// best-effort; failures here are logged, never returned.
    fn cleanup_failed_workspace(
        &self,
        workspace: &mut Workspace,
        progress: &Progress,
        error: &ProvisionError,
    ) {
        warn!(workspace_id = %workspace.id, error = %error, "Provisioning failed; cleaning up");
        let username = workspace.username.clone();

        if progress.route_attempted {
            if let Err(e) = self.routes.remove_route(&workspace.hostname) {
                warn!(hostname = %workspace.hostname, error = %e, "Failed to remove route");
            }
        }
        for unit in std::mem::take(&mut workspace.service_units) {
            if let Err(e) = self.supervisor.remove_unit(&unit) {
                warn!(unit = %unit, error = %e, "Failed to remove template service");
            }
        }
        if progress.editor_installed {
            if let Err(e) = self.supervisor.uninstall(&username) {
                warn!(username = %username, error = %e, "Failed to remove editor service");
            }
        }
        if progress.account_created {
            if let Err(e) = self.accounts.delete_account(&username) {
                warn!(username = %username, error = %e, "Failed to delete account");
            }
        }
        if let Some(port) = progress.port {
            if let Err(e) = self.ports.release(port) {
                warn!(port, error = %e, "Failed to release port");
            }
        }

        workspace.port = None;
        workspace.is_running = false;
        workspace.public_url = None;
        workspace.error_message = Some(error.short_reason());
        if let Err(e) = workspace.transition(WorkspaceStatus::Error) {
            warn!(workspace_id = %workspace.id, error = %e, "Unexpected status during cleanup");
        }
        if let Err(e) = self.repository.save_workspace(workspace) {
            warn!(workspace_id = %workspace.id, error = %e, "Failed to persist failed workspace");
        }
    }

    /// Remove a workspace and everything it owns on the host.
    #[instrument(skip(self))]
    pub fn deprovision(&self, id: &str) -> Result<()> {
        self.locks.with(id, || self.deprovision_locked(id))?;
        self.locks.forget(id);
        Ok(())
    }

    fn deprovision_locked(&self, id: &str) -> Result<()> {
        let mut workspace = self.workspace(id)?;
        workspace.transition(WorkspaceStatus::Deleting)?;
        self.repository.save_workspace(&workspace)?;

        // A workspace without a port never got, or already gave back, its host resources.
        if let Some(port) = workspace.port {
            let username = workspace.username.as_str();
            self.supervisor.stop(username)?;
            self.supervisor.uninstall(username)?;
            for unit in &workspace.service_units {
                self.supervisor.remove_unit(unit)?;
            }
            self.routes.remove_route(&workspace.hostname)?;
            self.accounts.delete_account(username)?;
            self.ports.release(port)?;
        }

        self.repository.delete_workspace(id)?;
        info!(workspace_id = %id, "Workspace deprovisioned");
        self.events
            .emit(ProvisionEvent::for_workspace(&workspace, None));
        Ok(())
    }

    /// Start the editor. A running `Active` workspace is left alone.
    #[instrument(skip(self))]
    pub fn start(&self, id: &str) -> Result<Workspace> {
        self.locks.with(id, || self.start_locked(id))
    }

    fn start_locked(&self, id: &str) -> Result<Workspace> {
        let mut workspace = self.workspace(id)?;
        match workspace.status {
            WorkspaceStatus::Active => {
                if self.supervisor.status(&workspace.username)?.is_running() {
                    debug!(workspace_id = %id, "Already running");
                    if !workspace.is_running {
                        workspace.mark_running();
                        self.repository.save_workspace(&workspace)?;
                    }
                    return Ok(workspace);
                }
                self.supervisor.start(&workspace.username)?;
                workspace.mark_running();
                self.repository.save_workspace(&workspace)?;
                Ok(workspace)
            }
            WorkspaceStatus::Stopped => {
                workspace.transition(WorkspaceStatus::Starting)?;
                self.repository.save_workspace(&workspace)?;
                self.bring_up(workspace, |s, user| s.start(user).map(|_| ()))
            }
            other => Err(invalid_state(id, "start", other)),
        }
    }

    /// Stop the editor; the port and account are kept. Stopping a stopped workspace is a no-op.
    #[instrument(skip(self))]
    pub fn stop(&self, id: &str) -> Result<Workspace> {
        self.locks.with(id, || self.stop_locked(id))
    }

    fn stop_locked(&self, id: &str) -> Result<Workspace> {
        let mut workspace = self.workspace(id)?;
        match workspace.status {
            WorkspaceStatus::Stopped => {
                debug!(workspace_id = %id, "Already stopped");
                Ok(workspace)
            }
            WorkspaceStatus::Active => {
                workspace.transition(WorkspaceStatus::Stopping)?;
                self.repository.save_workspace(&workspace)?;
                match self.supervisor.stop(&workspace.username) {
                    Ok(_) => {
                        workspace.transition(WorkspaceStatus::Stopped)?;
                        workspace.mark_stopped();
                        workspace.error_message = None;
                        self.repository.save_workspace(&workspace)?;
                        info!(workspace_id = %id, "Workspace stopped");
                        Ok(workspace)
                    }
                    Err(e) => {
                        workspace.transition(WorkspaceStatus::Active)?;
                        workspace.error_message = Some(e.short_reason());
                        self.repository.save_workspace(&workspace)?;
                        Err(e)
                    }
                }
            }
            other => Err(invalid_state(id, "stop", other)),
        }
    }

    #[instrument(skip(self))]
    pub fn restart(&self, id: &str) -> Result<Workspace> {
        self.locks.with(id, || self.restart_locked(id))
    }

    fn restart_locked(&self, id: &str) -> Result<Workspace> {
        let mut workspace = self.workspace(id)?;
        match workspace.status {
            WorkspaceStatus::Stopped => self.start_locked(id),
            WorkspaceStatus::Active => {
                workspace.transition(WorkspaceStatus::Starting)?;
                self.repository.save_workspace(&workspace)?;
                self.bring_up(workspace, |s, user| s.restart(user))
            }
            other => Err(invalid_state(id, "restart", other)),
        }
    }

    /// Finish a `Starting` workspace: `Active` on success, back to `Stopped` on failure.
    fn bring_up<F>(&self, mut workspace: Workspace, op: F) -> Result<Workspace>
    where
        F: FnOnce(&ServiceSupervisor, &str) -> Result<()>,
    {
        match op(self.supervisor.as_ref(), &workspace.username) {
            Ok(()) => {
                workspace.transition(WorkspaceStatus::Active)?;
                workspace.mark_running();
                workspace.error_message = None;
                self.repository.save_workspace(&workspace)?;
                info!(workspace_id = %workspace.id, "Workspace running");
                Ok(workspace)
            }
            Err(e) => {
                workspace.transition(WorkspaceStatus::Stopped)?;
                workspace.mark_stopped();
                workspace.error_message = Some(e.short_reason());
                self.repository.save_workspace(&workspace)?;
                Err(e)
            }
        }
    }

    pub fn status(&self, id: &str) -> Result<StatusReport> {
        let workspace = self.workspace(id)?;
        let service = match workspace.port {
            Some(_) => Some(self.supervisor.status(&workspace.username)?),
            None => None,
        };
        Ok(StatusReport { workspace, service })
    }

    pub fn logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        let workspace = self.workspace(id)?;
        if workspace.port.is_none() {
            return Err(invalid_state(id, "read logs of", workspace.status));
        }
        self.supervisor.tail_logs(&workspace.username, lines)
    }

    /// Align `is_running` of every `Active` workspace with what the supervisor reports.
    /// Returns how many records were corrected.
    #[instrument(skip(self))]
    pub fn reconcile(&self) -> Result<usize> {
        let mut corrected = 0;
        for listed in self.repository.list_active_workspaces()? {
            if self.locks.with(&listed.id, || self.reconcile_one(&listed.id))? {
                corrected += 1;
            }
        }
        info!(corrected, "Reconciled workspaces");
        Ok(corrected)
    }

    /// Re-read the record under its lock; one that was deleted or left `Active` since
    /// the listing is skipped.
    fn reconcile_one(&self, id: &str) -> Result<bool> {
        let Some(mut workspace) = self.repository.load_workspace(id)? else {
            debug!(workspace_id = %id, "Workspace removed before reconcile");
            return Ok(false);
        };
        if workspace.status != WorkspaceStatus::Active {
            return Ok(false);
        }
        let state = match self.supervisor.status(&workspace.username) {
            Ok(state) => state,
            Err(e) => {
                warn!(workspace_id = %id, error = %e, "Could not query editor state");
                return Ok(false);
            }
        };
        let running = state.is_running();
        if running == workspace.is_running {
            return Ok(false);
        }
        warn!(
            workspace_id = %id,
            recorded = workspace.is_running,
            observed = %state,
            "Editor state drifted"
        );
        if running {
            workspace.mark_running();
        } else {
            workspace.mark_stopped();
        }
        self.repository.save_workspace(&workspace)?;
        Ok(true)
    }

    /// Derive account and host names, suffixing until neither collides with a known workspace.
    fn unique_identity(&self, request: &CreateWorkspaceRequest) -> Result<(String, String)> {
        let base_user = derive_username(&request.tenant_id, &request.name)?;
        let base_host = derive_hostname(&request.tenant_id, &request.name, &self.config.base_domain)?;

        let existing = self.repository.list_workspaces()?;
        let users: HashSet<&str> = existing.iter().map(|w| w.username.as_str()).collect();
        let hosts: HashSet<&str> = existing.iter().map(|w| w.hostname.as_str()).collect();

        for n in 1..=MAX_NAME_ATTEMPTS {
            let (username, hostname) = if n == 1 {
                (base_user.clone(), base_host.clone())
            } else {
                (suffix_username(&base_user, n)?, suffix_hostname(&base_host, n)?)
            };
            if !users.contains(username.as_str()) && !hosts.contains(hostname.as_str()) {
                return Ok((username, hostname));
            }
        }
        Err(ProvisionError::InvalidInput(format!(
            "No free account name for workspace '{}' of tenant '{}'",
            request.name, request.tenant_id
        )))
    }
}

fn suffix_username(base: &str, n: u32) -> Result<String> {
    let suffix = format!("_{}", n);
    let keep = MAX_USERNAME_LEN.saturating_sub(suffix.len()).min(base.len());
    let username = format!("{}{}", base[..keep].trim_end_matches('_'), suffix);
    validate_username(&username)?;
    Ok(username)
}

fn suffix_hostname(base: &str, n: u32) -> Result<String> {
    let (label, domain) = match base.split_once('.') {
        Some((label, domain)) => (label, Some(domain)),
        None => (base, None),
    };
    let suffix = format!("-{}", n);
    let keep = MAX_LABEL_LEN.saturating_sub(suffix.len()).min(label.len());
    let label = format!("{}{}", label[..keep].trim_end_matches('-'), suffix);
    let hostname = match domain {
        Some(domain) => format!("{}.{}", label, domain),
        None => label,
    };
    validate_hostname(&hostname)?;
    Ok(hostname)
}

fn service_install(editor: &EditorService, err: ProvisionError) -> ProvisionError {
    ProvisionError::ServiceInstall {
        username: editor.username.clone(),
        port: editor.port,
        reason: err.to_string(),
    }
}

fn invalid_state(id: &str, operation: &str, status: WorkspaceStatus) -> ProvisionError {
    ProvisionError::InvalidState(format!(
        "cannot {} workspace {} while it is {}",
        operation, id, status
    ))
}
