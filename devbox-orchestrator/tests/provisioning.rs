//! End-to-end provisioning against the in-memory host.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use devbox_core::fake::FakeSystem;
use devbox_core::{CommandSpec, ErrorKind, ProvisionError, Result, System};
use devbox_orchestrator::{
    CreateWorkspaceRequest, InMemoryWorkspaceRepository, OrchestratorConfig, ProvisionEvent,
    Provisioner, Workspace, WorkspaceRepository, WorkspaceStatus,
};
use devbox_ports::{PortAllocator, PortRange};
use devbox_proxy::RouteManager;
use devbox_template::{InMemoryCatalog, Template};
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};

const UNIT_DIR: &str = "/etc/systemd/system";

const PYTHON_TEMPLATE: &str = r#"
id: python
name: Python project
workspace_file: "${home_dir}/${project}.code-workspace"
actions:
  - id: ssh
    type: generate_ssh_key
    order: 10
  - id: worker
    type: create_service
    order: 20
    parameters:
      name: worker
      command: "python3 -m http.server"
  - id: done
    type: complete
    order: 100
    parameters:
      message: "${project} ready"
"#;

const BROKEN_TEMPLATE: &str = r#"
id: broken
name: Broken clone
actions:
  - id: worker
    type: create_service
    order: 10
    parameters:
      name: worker
      command: "sleep infinity"
  - id: clone
    type: git_clone
    order: 20
    parameters:
      url: https://github.com/acme/missing.git
      dest: "${home_dir}/missing"
"#;

/// Remembers every status a workspace was persisted with. A frozen active list stands
/// in for a listing taken just before a concurrent lifecycle call.
#[derive(Default)]
struct RecordingRepository {
    inner: InMemoryWorkspaceRepository,
    saved: Mutex<Vec<(String, WorkspaceStatus)>>,
    frozen_active: Mutex<Option<Vec<Workspace>>>,
}

impl RecordingRepository {
    fn freeze_active_list(&self) {
        let active = self.inner.list_active_workspaces().unwrap();
        *self.frozen_active.lock().unwrap() = Some(active);
    }

    fn history(&self, id: &str) -> Vec<WorkspaceStatus> {
        let saved = self.saved.lock().unwrap();
        let mut history: Vec<WorkspaceStatus> = Vec::new();
        for (_, status) in saved.iter().filter(|(ws, _)| ws == id) {
            if history.last() != Some(status) {
                history.push(*status);
            }
        }
        history
    }
}

impl WorkspaceRepository for RecordingRepository {
    fn load_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        self.inner.load_workspace(id)
    }

    fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((workspace.id.clone(), workspace.status));
        self.inner.save_workspace(workspace)
    }

    fn delete_workspace(&self, id: &str) -> Result<bool> {
        self.inner.delete_workspace(id)
    }

    fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.inner.list_workspaces()
    }

    fn list_active_workspaces(&self) -> Result<Vec<Workspace>> {
        match self.frozen_active.lock().unwrap().clone() {
            Some(active) => Ok(active),
            None => self.inner.list_active_workspaces(),
        }
    }
}

struct Harness {
    _dir: TempDir,
    config: OrchestratorConfig,
    fake: Arc<FakeSystem>,
    repository: Arc<RecordingRepository>,
    provisioner: Provisioner,
    events: UnboundedReceiver<ProvisionEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_ports(8100, 8104)
    }

    fn with_ports(start: u16, end: u16) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            port_range: PortRange::new(start, end).unwrap(),
            state_dir: dir.path().join("state"),
            route_config_path: dir.path().join("routes.yml"),
            base_domain: "ws.example.com".to_string(),
            unit_dir: PathBuf::from(UNIT_DIR),
            editor_bin: "code-server".to_string(),
            ..OrchestratorConfig::default()
        };
        let fake = Arc::new(FakeSystem::new());
        let repository = Arc::new(RecordingRepository::default());
        let catalog = Arc::new(
            InMemoryCatalog::new()
                .with_template(Template::from_yaml(PYTHON_TEMPLATE).unwrap())
                .with_template(Template::from_yaml(BROKEN_TEMPLATE).unwrap()),
        );
        let (tx, events) = mpsc::unbounded_channel();
        let provisioner =
            Provisioner::new(config.clone(), fake.clone(), repository.clone(), catalog)
                .unwrap()
                .with_event_sink(Arc::new(tx));

        Self {
            _dir: dir,
            config,
            fake,
            repository,
            provisioner,
            events,
        }
    }

    fn routes(&self) -> RouteManager {
        RouteManager::new(&self.config.route_config_path, self.config.route_settings())
    }

    fn allocated_ports(&self) -> usize {
        PortAllocator::open(self.config.port_registry_path(), self.config.port_range)
            .unwrap()
            .allocated()
            .unwrap()
            .len()
    }

    fn unit_file(&self, unit: &str) -> Option<String> {
        self.fake.file(PathBuf::from(UNIT_DIR).join(unit))
    }

    fn next_event(&mut self) -> ProvisionEvent {
        self.events.try_recv().expect("event emitted")
    }
}

#[test]
fn test_provision_without_template() {
    let mut h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1").disk_quota_gb(10))
        .unwrap();

    assert_eq!(ws.status, WorkspaceStatus::Active);
    assert!(ws.is_running);
    assert!(ws.last_started_at.is_some());
    assert_eq!(ws.username, "acme_dev1");
    assert_eq!(ws.hostname, "dev1-acme.ws.example.com");
    assert_eq!(ws.public_url.as_deref(), Some("https://dev1-acme.ws.example.com"));
    assert_eq!(ws.auth_secret.len(), 24);
    assert!(ws.quota_enforced);

    let port = ws.port.unwrap();
    assert!((8100..=8104).contains(&port));
    assert!(h.fake.has_user("acme_dev1"));
    assert!(h.fake.is_unit_active("devbox-editor-acme_dev1.service"));
    assert_eq!(h.routes().route_for(&ws.hostname).unwrap(), Some(port));
    assert_eq!(h.allocated_ports(), 1);
    assert_eq!(h.fake.count_matching("setquota -u acme_dev1"), 1);

    assert_eq!(h.provisioner.workspace(&ws.id).unwrap(), ws);

    let event = h.next_event();
    assert_eq!(event.status, WorkspaceStatus::Active);
    assert_eq!(event.public_url, ws.public_url);
    assert_eq!(event.error_kind, None);
}

#[test]
fn test_provision_with_template() {
    let mut h = Harness::new();
    let ws = h
        .provisioner
        .provision(
            &CreateWorkspaceRequest::new("acme", "dev1")
                .template("python")
                .variable("project", "api")
                .variable("username", "root"),
        )
        .unwrap();

    assert_eq!(ws.status, WorkspaceStatus::Active);
    assert!(ws
        .ssh_public_key
        .as_deref()
        .is_some_and(|k| k.starts_with("ssh-ed25519")));
    assert_eq!(ws.service_units, vec!["devbox-acme_dev1-worker.service"]);
    assert!(h.fake.is_unit_active("devbox-acme_dev1-worker.service"));

    // The editor is reopened on the template's workspace file.
    let unit = h.unit_file("devbox-editor-acme_dev1.service").unwrap();
    assert!(unit.contains("/home/acme_dev1/api.code-workspace"));

    // A caller variable never shadows a built-in.
    assert!(h.fake.has_dir("/home/acme_dev1/.ssh"));
    assert!(!h.fake.has_dir("/home/root"));

    let event = h.next_event();
    assert_eq!(event.ssh_public_key, ws.ssh_public_key);
}

#[test]
fn test_quota_failure_is_not_fatal() {
    let h = Harness::new();
    h.fake.fail_command("setquota", 1);

    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1").disk_quota_gb(5))
        .unwrap();
    assert_eq!(ws.status, WorkspaceStatus::Active);
    assert!(!ws.quota_enforced);
}

#[test]
fn test_existing_account_fails_and_cleans_up() {
    let mut h = Harness::new();
    h.fake.add_user("acme_dev1");

    let err = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::AccountCreation { .. }));

    let records = h.provisioner.list_workspaces().unwrap();
    assert_eq!(records.len(), 1);
    let ws = &records[0];
    assert_eq!(ws.status, WorkspaceStatus::Error);
    assert_eq!(ws.port, None);
    assert!(!ws.is_running);
    assert!(ws
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("acme_dev1")));

    // The pre-existing account is not ours to delete.
    assert!(h.fake.has_user("acme_dev1"));
    assert_eq!(h.allocated_ports(), 0);
    assert!(h.routes().routes().unwrap().is_empty());
    assert!(h.unit_file("devbox-editor-acme_dev1.service").is_none());

    let event = h.next_event();
    assert_eq!(event.status, WorkspaceStatus::Error);
    assert_eq!(event.error_kind, Some(ErrorKind::AccountCreation));
}

#[test]
fn test_template_failure_rolls_back_everything() {
    let mut h = Harness::new();
    h.fake.fail_command("git clone", 128);

    let err = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1").template("broken"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActionExecution);

    assert!(!h.fake.has_user("acme_dev1"));
    assert!(h.unit_file("devbox-editor-acme_dev1.service").is_none());
    assert!(h.unit_file("devbox-acme_dev1-worker.service").is_none());
    assert!(!h.fake.is_unit_active("devbox-acme_dev1-worker.service"));
    assert_eq!(h.allocated_ports(), 0);
    assert!(h.routes().routes().unwrap().is_empty());

    let ws = &h.provisioner.list_workspaces().unwrap()[0];
    assert_eq!(ws.status, WorkspaceStatus::Error);
    assert!(ws.service_units.is_empty());
    assert_eq!(h.next_event().error_kind, Some(ErrorKind::ActionExecution));
}

#[test]
fn test_unknown_template_allocates_nothing() {
    let mut h = Harness::new();
    let err = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1").template("rust"))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::TemplateNotFound(id) if id == "rust"));
    assert!(h.provisioner.list_workspaces().unwrap().is_empty());
    assert_eq!(h.allocated_ports(), 0);
    assert!(h.fake.commands().is_empty());

    let event = h.next_event();
    assert_eq!(event.status, WorkspaceStatus::Error);
    assert_eq!(event.error_kind, Some(ErrorKind::TemplateNotFound));
    assert!(event.workspace_id.is_empty());
    assert_eq!((event.tenant_id.as_str(), event.name.as_str()), ("acme", "dev1"));
}

#[test]
fn test_invalid_name_emits_rejection() {
    let mut h = Harness::new();
    let err = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("!!!", "???"))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidInput(_)));
    assert!(h.provisioner.list_workspaces().unwrap().is_empty());
    assert_eq!(h.next_event().error_kind, Some(ErrorKind::InvalidInput));
}

#[test]
fn test_port_exhaustion() {
    let h = Harness::with_ports(8100, 8101);
    for name in ["a", "b"] {
        h.provisioner
            .provision(&CreateWorkspaceRequest::new("acme", name))
            .unwrap();
    }

    let err = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "c"))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::PortExhausted { .. }));
    assert!(!h.fake.has_user("acme_c"));
    assert_eq!(h.allocated_ports(), 2);
}

#[test]
fn test_names_are_made_unique() {
    let h = Harness::new();
    let first = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();
    let second = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();

    assert_eq!(second.username, "acme_dev1_2");
    assert_eq!(second.hostname, "dev1-acme-2.ws.example.com");
    assert_ne!(first.port, second.port);
    assert_eq!(h.routes().routes().unwrap().len(), 2);
}

#[test]
fn test_start_stop_restart_are_idempotent() {
    let h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();
    let unit = "devbox-editor-acme_dev1.service";

    let stopped = h.provisioner.stop(&ws.id).unwrap();
    assert_eq!(stopped.status, WorkspaceStatus::Stopped);
    assert!(!stopped.is_running);
    assert!(stopped.last_stopped_at.is_some());
    assert!(!h.fake.is_unit_active(unit));
    // Port and account survive a stop.
    assert_eq!(stopped.port, ws.port);
    assert!(h.fake.has_user("acme_dev1"));

    let again = h.provisioner.stop(&ws.id).unwrap();
    assert_eq!(again.status, WorkspaceStatus::Stopped);

    let started = h.provisioner.start(&ws.id).unwrap();
    assert_eq!(started.status, WorkspaceStatus::Active);
    assert!(started.is_running);
    assert!(h.fake.is_unit_active(unit));

    let starts = h.fake.count_matching("systemctl start");
    let again = h.provisioner.start(&ws.id).unwrap();
    assert_eq!(again.status, WorkspaceStatus::Active);
    assert_eq!(h.fake.count_matching("systemctl start"), starts);

    let restarted = h.provisioner.restart(&ws.id).unwrap();
    assert_eq!(restarted.status, WorkspaceStatus::Active);
    assert_eq!(h.fake.count_matching("systemctl restart"), 1);

    let history = h.repository.history(&ws.id);
    assert_eq!(history.first(), Some(&WorkspaceStatus::Provisioning));
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal transition {} -> {}",
            pair[0],
            pair[1]
        );
    }
    assert!(history.contains(&WorkspaceStatus::Stopping));
    assert!(history.contains(&WorkspaceStatus::Starting));
}

#[test]
fn test_failed_start_returns_to_stopped() {
    let h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();
    h.provisioner.stop(&ws.id).unwrap();

    h.fake.fail_command("systemctl start", 1);
    assert!(h.provisioner.start(&ws.id).is_err());
    let ws = h.provisioner.workspace(&ws.id).unwrap();
    assert_eq!(ws.status, WorkspaceStatus::Stopped);
    assert!(ws.error_message.is_some());
}

#[test]
fn test_lifecycle_on_error_workspace_is_rejected() {
    let h = Harness::new();
    h.fake.add_user("acme_dev1");
    let _ = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"));
    let id = h.provisioner.list_workspaces().unwrap()[0].id.clone();

    assert!(matches!(
        h.provisioner.start(&id),
        Err(ProvisionError::InvalidState(_))
    ));
    assert!(matches!(
        h.provisioner.stop(&id),
        Err(ProvisionError::InvalidState(_))
    ));
    assert!(h.provisioner.status(&id).unwrap().service.is_none());

    // An errored workspace holds nothing on the host; deleting it only drops the record.
    h.provisioner.deprovision(&id).unwrap();
    assert!(h.provisioner.list_workspaces().unwrap().is_empty());
    assert!(h.fake.has_user("acme_dev1"));
}

#[test]
fn test_status_and_logs() {
    let h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();

    let report = h.provisioner.status(&ws.id).unwrap();
    assert!(report.service.is_some_and(|s| s.is_running()));
    assert_eq!(report.workspace.id, ws.id);

    let logs = h.provisioner.logs(&ws.id, 20).unwrap();
    assert!(!logs.is_empty());
    assert_eq!(
        h.fake
            .count_matching("journalctl -u devbox-editor-acme_dev1.service -n 20"),
        1
    );

    assert!(matches!(
        h.provisioner.status("missing"),
        Err(ProvisionError::NotFound(_))
    ));
}

#[test]
fn test_reconcile_corrects_drift() {
    let h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();
    h.provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev2"))
        .unwrap();
    assert_eq!(h.provisioner.reconcile().unwrap(), 0);

    // The editor died behind our back.
    h.fake
        .run(&CommandSpec::new("systemctl").args(["stop", "devbox-editor-acme_dev1.service"]))
        .unwrap();

    assert_eq!(h.provisioner.reconcile().unwrap(), 1);
    let drifted = h.provisioner.workspace(&ws.id).unwrap();
    assert_eq!(drifted.status, WorkspaceStatus::Active);
    assert!(!drifted.is_running);
    assert_eq!(h.provisioner.reconcile().unwrap(), 0);

    // start notices the stale record and brings the editor back.
    let started = h.provisioner.start(&ws.id).unwrap();
    assert!(started.is_running);
    assert!(h.fake.is_unit_active("devbox-editor-acme_dev1.service"));
}

#[test]
fn test_reconcile_skips_workspace_deleted_after_listing() {
    let h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();
    h.repository.freeze_active_list();

    h.provisioner.deprovision(&ws.id).unwrap();

    // The listing still says Active and running; the editor is gone.
    assert_eq!(h.provisioner.reconcile().unwrap(), 0);
    assert!(h.repository.load_workspace(&ws.id).unwrap().is_none());
}

#[test]
fn test_reconcile_keeps_stop_that_raced_the_listing() {
    let h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();
    h.repository.freeze_active_list();

    h.provisioner.stop(&ws.id).unwrap();

    assert_eq!(h.provisioner.reconcile().unwrap(), 0);
    let stored = h.provisioner.workspace(&ws.id).unwrap();
    assert_eq!(stored.status, WorkspaceStatus::Stopped);
    assert!(!stored.is_running);
}

#[test]
fn test_deprovision_releases_everything() {
    let mut h = Harness::new();
    let ws = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1").template("python").variable("project", "api"))
        .unwrap();
    let _ = h.next_event();

    h.provisioner.deprovision(&ws.id).unwrap();

    assert!(!h.fake.has_user("acme_dev1"));
    assert!(h.unit_file("devbox-editor-acme_dev1.service").is_none());
    assert!(h.unit_file("devbox-acme_dev1-worker.service").is_none());
    assert!(h.routes().routes().unwrap().is_empty());
    assert_eq!(h.allocated_ports(), 0);
    assert!(h.provisioner.workspace(&ws.id).is_err());
    assert_eq!(
        h.repository.history(&ws.id).last(),
        Some(&WorkspaceStatus::Deleting)
    );
    assert_eq!(h.next_event().status, WorkspaceStatus::Deleting);

    assert!(matches!(
        h.provisioner.deprovision(&ws.id),
        Err(ProvisionError::NotFound(_))
    ));
}

#[test]
fn test_released_port_is_reused() {
    let h = Harness::with_ports(8100, 8100);
    let first = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev1"))
        .unwrap();
    h.provisioner.deprovision(&first.id).unwrap();

    let second = h
        .provisioner
        .provision(&CreateWorkspaceRequest::new("acme", "dev2"))
        .unwrap();
    assert_eq!(second.port, Some(8100));
}
