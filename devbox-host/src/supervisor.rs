//! systemd units for workspace editors and template-defined services.
//!
//! Unit files are rendered with Tera and written atomically through the [`System`]
//! seam; every state change is a `systemctl` call.

// Standard library
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

// External crates
use devbox_core::validation::{validate_identifier, validate_username};
use devbox_core::{CommandSpec, ProvisionError, Result, System};
use serde::{Deserialize, Serialize};
use tera::{Context as TeraContext, Tera};
use tracing::{debug, info, instrument, warn};

const EDITOR_UNIT_TEMPLATE: &str = r#"# Managed by devbox. Changes will be overwritten.
[Unit]
Description=devbox editor for {{ username }}
After=network.target

[Service]
Type=simple
User={{ username }}
Group={{ username }}
WorkingDirectory={{ work_dir }}
Environment="PASSWORD={{ password }}"
ExecStart={{ editor_bin }} --bind-addr 127.0.0.1:{{ port }} --auth password --disable-telemetry{% if open_path %} "{{ open_path }}"{% endif %}
Restart=on-failure
RestartSec=5
{% if memory_mb %}MemoryMax={{ memory_mb }}M
{% endif %}{% if cpu_quota %}CPUQuota={{ cpu_quota }}%
{% endif %}{% if max_processes %}TasksMax={{ max_processes }}
{% endif %}
[Install]
WantedBy=multi-user.target
"#;

const SERVICE_UNIT_TEMPLATE: &str = r#"# Managed by devbox. Changes will be overwritten.
[Unit]
Description={{ description }}
After=network.target

[Service]
Type=simple
User={{ username }}
Group={{ username }}
WorkingDirectory={{ work_dir }}
{% for line in environment %}Environment="{{ line }}"
{% endfor %}ExecStart=/bin/bash -lc "{{ command }}"
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
"#;

/// Shared template engine for unit files
static UNIT_TERA: OnceLock<Tera> = OnceLock::new();

fn unit_tera() -> &'static Tera {
    UNIT_TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_template("editor.service", EDITOR_UNIT_TEMPLATE)
            .expect("Failed to add editor unit template");
        tera.add_raw_template("service.service", SERVICE_UNIT_TEMPLATE)
            .expect("Failed to add service unit template");
        tera
    })
}

/// Per-workspace cgroup limits applied to the editor unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub max_processes: Option<u32>,
}

/// Observed state of a unit, from `systemctl is-active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
    Activating,
    Unknown,
}

impl ServiceState {
    fn parse(output: &str) -> Self {
        match output.trim() {
            "active" | "reloading" => ServiceState::Active,
            "inactive" => ServiceState::Inactive,
            "failed" => ServiceState::Failed,
            "activating" => ServiceState::Activating,
            _ => ServiceState::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, ServiceState::Active | ServiceState::Activating)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Active => "active",
            ServiceState::Inactive => "inactive",
            ServiceState::Failed => "failed",
            ServiceState::Activating => "activating",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The editor instance of one workspace.
#[derive(Debug, Clone)]
pub struct EditorService {
    pub username: String,
    pub port: u16,
    pub auth_secret: String,
    pub work_dir: PathBuf,
    /// Folder or multi-root workspace file the editor opens on start.
    pub open_path: Option<PathBuf>,
    pub limits: ResourceLimits,
}

/// An additional long-running process supervised for an account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceUnit {
    pub username: String,
    pub name: String,
    pub command: String,
    pub work_dir: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub description: Option<String>,
}

/// Installs and controls systemd units on behalf of workspaces.
pub struct ServiceSupervisor {
    system: Arc<dyn System>,
    unit_dir: PathBuf,
    editor_bin: String,
}

impl ServiceSupervisor {
    pub fn new(system: Arc<dyn System>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            system,
            unit_dir: unit_dir.into(),
            editor_bin: "/usr/bin/code-server".to_string(),
        }
    }

    pub fn with_editor_bin(mut self, editor_bin: impl Into<String>) -> Self {
        self.editor_bin = editor_bin.into();
        self
    }

    pub fn editor_bin(&self) -> &str {
        &self.editor_bin
    }

    pub fn editor_unit(username: &str) -> String {
        format!("devbox-editor-{}.service", username)
    }

    pub fn service_unit(username: &str, name: &str) -> String {
        format!("devbox-{}-{}.service", username, name)
    }

    fn unit_path(&self, unit: &str) -> PathBuf {
        self.unit_dir.join(unit)
    }

    /// Write (or overwrite) the editor unit and enable it. The unit is not started.
    #[instrument(skip(self, editor), fields(username = %editor.username, port = editor.port))]
    pub fn install_editor_service(&self, editor: &EditorService) -> Result<String> {
        let fail = |reason: String| ProvisionError::ServiceInstall {
            username: editor.username.clone(),
            port: editor.port,
            reason,
        };
        validate_username(&editor.username).map_err(|e| fail(e.to_string()))?;

        let mut context = TeraContext::new();
        context.insert("username", &editor.username);
        context.insert("port", &editor.port);
        context.insert("password", &quote_value(&editor.auth_secret));
        context.insert("editor_bin", &self.editor_bin);
        context.insert("work_dir", &editor.work_dir.to_string_lossy());
        context.insert(
            "open_path",
            &editor
                .open_path
                .as_ref()
                .map(|p| quote_value(&p.to_string_lossy())),
        );
        context.insert("memory_mb", &editor.limits.memory_mb);
        context.insert("cpu_quota", &editor.limits.cpu_cores.map(|c| c * 100));
        context.insert("max_processes", &editor.limits.max_processes);

        let content = unit_tera()
            .render("editor.service", &context)
            .map_err(|e| fail(format!("rendering unit: {e}")))?;

        let unit = Self::editor_unit(&editor.username);
        self.system
            .write_file(&self.unit_path(&unit), &content, 0o600)
            .map_err(|e| fail(e.to_string()))?;
        self.daemon_reload().map_err(|e| fail(e.to_string()))?;
        self.systemctl(&["enable", &unit])
            .map_err(|e| fail(e.to_string()))?;

        info!(unit = %unit, "Installed editor service");
        Ok(unit)
    }

    /// Start the editor. Returns `false` if it was already running.
    #[instrument(skip(self))]
    pub fn start(&self, username: &str) -> Result<bool> {
        let unit = Self::editor_unit(username);
        if self.unit_state(&unit)?.is_running() {
            debug!(unit = %unit, "Already running");
            return Ok(false);
        }
        self.systemctl(&["start", &unit])?;
        info!(unit = %unit, "Started service");
        Ok(true)
    }

    /// Stop the editor. Returns `false` if it was not running.
    #[instrument(skip(self))]
    pub fn stop(&self, username: &str) -> Result<bool> {
        let unit = Self::editor_unit(username);
        if !self.unit_state(&unit)?.is_running() {
            debug!(unit = %unit, "Already stopped");
            return Ok(false);
        }
        self.systemctl(&["stop", &unit])?;
        info!(unit = %unit, "Stopped service");
        Ok(true)
    }

    #[instrument(skip(self))]
    pub fn restart(&self, username: &str) -> Result<()> {
        let unit = Self::editor_unit(username);
        self.systemctl(&["restart", &unit])?;
        info!(unit = %unit, "Restarted service");
        Ok(())
    }

    pub fn status(&self, username: &str) -> Result<ServiceState> {
        self.unit_state(&Self::editor_unit(username))
    }

    /// The last `lines` journal lines of the editor unit.
    pub fn tail_logs(&self, username: &str, lines: usize) -> Result<Vec<String>> {
        let unit = Self::editor_unit(username);
        let output = self.system.run_checked(&CommandSpec::new("journalctl").args([
            "-u".to_string(),
            unit,
            "-n".to_string(),
            lines.to_string(),
            "--no-pager".to_string(),
            "-o".to_string(),
            "cat".to_string(),
        ]))?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Stop, disable and delete the editor unit. An absent unit is fine.
    #[instrument(skip(self))]
    pub fn uninstall(&self, username: &str) -> Result<bool> {
        self.remove_unit(&Self::editor_unit(username))
    }

    /// Install and start an additional unit for an account.
    #[instrument(skip(self, service), fields(username = %service.username, name = %service.name))]
    pub fn install_service(&self, service: &ServiceUnit) -> Result<String> {
        validate_username(&service.username)?;
        validate_identifier("service", &service.name)?;
        for key in service.environment.keys() {
            if key.is_empty()
                || key.starts_with(|c: char| c.is_ascii_digit())
                || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ProvisionError::InvalidInput(format!(
                    "Invalid environment variable name: '{}'",
                    key
                )));
            }
        }

        let unit = Self::service_unit(&service.username, &service.name);
        // `~` is the account's home directory to systemd.
        let work_dir = service
            .work_dir
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "~".to_string());
        let environment: Vec<String> = service
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote_value(v)))
            .collect();

        let mut context = TeraContext::new();
        context.insert("username", &service.username);
        context.insert(
            "description",
            &service
                .description
                .clone()
                .unwrap_or_else(|| format!("devbox service {} for {}", service.name, service.username)),
        );
        context.insert("work_dir", &work_dir);
        context.insert("environment", &environment);
        context.insert("command", &quote_value(&service.command).replace('$', "$$"));

        let content = unit_tera()
            .render("service.service", &context)
            .map_err(|e| ProvisionError::Service(format!("rendering {unit}: {e}")))?;

        self.system.write_file(&self.unit_path(&unit), &content, 0o644)?;
        self.daemon_reload()?;
        self.systemctl(&["enable", "--now", &unit])?;
        info!(unit = %unit, "Installed service");
        Ok(unit)
    }

    #[instrument(skip(self))]
    pub fn remove_service(&self, username: &str, name: &str) -> Result<bool> {
        self.remove_unit(&Self::service_unit(username, name))
    }

    /// Disable and delete any unit this supervisor installed. `false` if it was absent.
    pub fn remove_unit(&self, unit: &str) -> Result<bool> {
        let path = self.unit_path(unit);
        if !self.system.path_exists(&path) {
            debug!(unit, "Unit not installed");
            return Ok(false);
        }
        // A unit that never started still has to be deleted.
        if let Err(e) = self.systemctl(&["disable", "--now", unit]) {
            warn!(unit, error = %e, "Failed to disable unit");
        }
        self.system.remove_path(&path)?;
        self.daemon_reload()?;
        info!(unit, "Removed unit");
        Ok(true)
    }

    fn unit_state(&self, unit: &str) -> Result<ServiceState> {
        // is-active exits non-zero for anything but "active"; the state is on stdout.
        let output = self
            .system
            .run(&CommandSpec::new("systemctl").args(["is-active", unit]))?;
        Ok(ServiceState::parse(&output.stdout))
    }

    fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"])
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        self.system
            .run_checked(&CommandSpec::new("systemctl").args(args.iter().copied()))
            .map(|_| ())
            .map_err(|e| ProvisionError::Service(e.to_string()))
    }

    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }
}

/// Escape a value placed inside a double-quoted systemd unit string.
fn quote_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
        .replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_core::fake::FakeSystem;

    fn supervisor() -> (Arc<FakeSystem>, ServiceSupervisor) {
        let system = Arc::new(FakeSystem::new());
        let supervisor = ServiceSupervisor::new(system.clone(), "/etc/systemd/system");
        (system, supervisor)
    }

    fn editor() -> EditorService {
        EditorService {
            username: "acme_dev1".to_string(),
            port: 8123,
            auth_secret: "Zx9secret".to_string(),
            work_dir: PathBuf::from("/home/acme_dev1"),
            open_path: Some(PathBuf::from("/home/acme_dev1/project.code-workspace")),
            limits: ResourceLimits {
                cpu_cores: Some(2),
                memory_mb: Some(2048),
                max_processes: None,
            },
        }
    }

    #[test]
    fn test_editor_unit_rendering() {
        let (system, supervisor) = supervisor();
        let unit = supervisor.install_editor_service(&editor()).unwrap();
        assert_eq!(unit, "devbox-editor-acme_dev1.service");

        let content = system
            .file("/etc/systemd/system/devbox-editor-acme_dev1.service")
            .expect("unit written");
        assert!(content.contains("User=acme_dev1"));
        assert!(content.contains("--bind-addr 127.0.0.1:8123"));
        assert!(content.contains(r#"Environment="PASSWORD=Zx9secret""#));
        assert!(content.contains(r#""/home/acme_dev1/project.code-workspace""#));
        assert!(content.contains("MemoryMax=2048M"));
        assert!(content.contains("CPUQuota=200%"));
        assert!(!content.contains("TasksMax"));

        assert!(system.is_unit_enabled(&unit));
        assert!(!system.is_unit_active(&unit));
        let commands = system.commands();
        let reload = commands.iter().position(|c| c == "systemctl daemon-reload").unwrap();
        let enable = commands.iter().position(|c| c.starts_with("systemctl enable")).unwrap();
        assert!(reload < enable);
    }

    #[test]
    fn test_reinstall_overwrites() {
        let (system, supervisor) = supervisor();
        supervisor.install_editor_service(&editor()).unwrap();
        let mut moved = editor();
        moved.port = 8200;
        supervisor.install_editor_service(&moved).unwrap();

        let content = system
            .file("/etc/systemd/system/devbox-editor-acme_dev1.service")
            .unwrap();
        assert!(content.contains("127.0.0.1:8200"));
        assert!(!content.contains("127.0.0.1:8123"));
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (system, supervisor) = supervisor();
        supervisor.install_editor_service(&editor()).unwrap();

        assert!(supervisor.start("acme_dev1").unwrap());
        assert!(!supervisor.start("acme_dev1").unwrap());
        assert_eq!(system.count_matching("systemctl start"), 1);
        assert_eq!(supervisor.status("acme_dev1").unwrap(), ServiceState::Active);

        assert!(supervisor.stop("acme_dev1").unwrap());
        assert!(!supervisor.stop("acme_dev1").unwrap());
        assert_eq!(system.count_matching("systemctl stop"), 1);
        assert_eq!(supervisor.status("acme_dev1").unwrap(), ServiceState::Inactive);
    }

    #[test]
    fn test_install_failure_is_typed() {
        let (system, supervisor) = supervisor();
        system.fail_command("systemctl enable", 1);
        let err = supervisor.install_editor_service(&editor()).unwrap_err();
        assert!(matches!(err, ProvisionError::ServiceInstall { port: 8123, .. }));
    }

    #[test]
    fn test_uninstall() {
        let (system, supervisor) = supervisor();
        supervisor.install_editor_service(&editor()).unwrap();
        supervisor.start("acme_dev1").unwrap();

        assert!(supervisor.uninstall("acme_dev1").unwrap());
        assert!(!system.is_unit_active("devbox-editor-acme_dev1.service"));
        assert!(system
            .file("/etc/systemd/system/devbox-editor-acme_dev1.service")
            .is_none());
        assert!(!supervisor.uninstall("acme_dev1").unwrap());
    }

    #[test]
    fn test_tail_logs() {
        let (_system, supervisor) = supervisor();
        let lines = supervisor.tail_logs("acme_dev1", 50).unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_extra_service() {
        let (system, supervisor) = supervisor();
        let service = ServiceUnit {
            username: "acme_dev1".to_string(),
            name: "api".to_string(),
            command: "python -m http.server $PORT".to_string(),
            work_dir: None,
            environment: BTreeMap::from([("PORT".to_string(), "9000".to_string())]),
            description: None,
        };
        let unit = supervisor.install_service(&service).unwrap();
        assert_eq!(unit, "devbox-acme_dev1-api.service");
        assert!(system.is_unit_active(&unit));

        let content = system.file(format!("/etc/systemd/system/{unit}")).unwrap();
        assert!(content.contains(r#"Environment="PORT=9000""#));
        assert!(content.contains(r#"ExecStart=/bin/bash -lc "python -m http.server $$PORT""#));
        assert!(content.contains("WorkingDirectory=~"));

        assert!(supervisor.remove_service("acme_dev1", "api").unwrap());
        assert!(!system.is_unit_active(&unit));
    }

    #[test]
    fn test_invalid_env_key_rejected() {
        let (_system, supervisor) = supervisor();
        let service = ServiceUnit {
            username: "acme_dev1".to_string(),
            name: "api".to_string(),
            command: "true".to_string(),
            environment: BTreeMap::from([("BAD KEY".to_string(), "x".to_string())]),
            ..Default::default()
        };
        assert!(supervisor.install_service(&service).is_err());
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(ServiceState::parse("active\n"), ServiceState::Active);
        assert_eq!(ServiceState::parse("failed"), ServiceState::Failed);
        assert_eq!(ServiceState::parse("activating"), ServiceState::Activating);
        assert_eq!(ServiceState::parse("weird"), ServiceState::Unknown);
    }
}
