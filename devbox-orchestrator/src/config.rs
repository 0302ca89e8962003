use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devbox_core::{ProvisionError, Result};
use devbox_logging::LogSettings;
use devbox_ports::PortRange;
use devbox_proxy::RouteSettings;
use devbox_template::{ActionTimeouts, ActionType, DatabaseSettings, HandlerSettings};
use serde::{Deserialize, Serialize};

const DEFAULT_PORT_RANGE: PortRange = PortRange {
    start: 8100,
    end: 8999,
};
const MIN_PASSWORD_LENGTH: usize = 12;

/// Host layout and tunables for the provisioner.
///
/// Loaded from YAML; every field has a default. `DEVBOX_*` environment variables
/// override the file (see [`apply_env`](Self::apply_env)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub port_range: PortRange,
    /// Port registry and workspace state live here.
    pub state_dir: PathBuf,
    /// Dynamic configuration file watched by the reverse proxy.
    pub route_config_path: PathBuf,
    pub base_domain: String,
    pub entry_point: String,
    pub cert_resolver: Option<String>,
    pub home_root: PathBuf,
    pub unit_dir: PathBuf,
    pub editor_bin: String,
    pub template_dir: PathBuf,
    pub password_length: usize,
    pub default_action_timeout_secs: u64,
    pub action_timeouts: BTreeMap<ActionType, u64>,
    pub database: DatabaseSettings,
    pub logging: LogSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_RANGE,
            state_dir: PathBuf::from("/var/lib/devbox"),
            route_config_path: PathBuf::from("/etc/traefik/dynamic/devbox.yml"),
            base_domain: "devbox.localhost".to_string(),
            entry_point: "websecure".to_string(),
            cert_resolver: Some("letsencrypt".to_string()),
            home_root: PathBuf::from("/home"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            editor_bin: "/usr/bin/code-server".to_string(),
            template_dir: PathBuf::from("/etc/devbox/templates"),
            password_length: 24,
            default_action_timeout_secs: 300,
            action_timeouts: BTreeMap::new(),
            database: DatabaseSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl OrchestratorConfig {
    /// Defaults, logging from `DEVBOX_LOG_*`, then the other `DEVBOX_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            logging: LogSettings::from_env(),
            ..Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file, then apply `DEVBOX_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml_ng::from_str(&content).map_err(|e| {
            ProvisionError::Serialization(format!("{}: {}", path.display(), e))
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `DEVBOX_PORT_RANGE`, `DEVBOX_STATE_DIR`, `DEVBOX_ROUTE_CONFIG`,
    /// `DEVBOX_BASE_DOMAIN`, `DEVBOX_HOME_ROOT`, `DEVBOX_UNIT_DIR`, `DEVBOX_EDITOR_BIN`
    /// and `DEVBOX_TEMPLATE_DIR`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(range) = env_value("DEVBOX_PORT_RANGE") {
            self.port_range = PortRange::parse(&range)
                .map_err(|e| ProvisionError::InvalidInput(format!("DEVBOX_PORT_RANGE: {e}")))?;
        }
        if let Some(dir) = env_value("DEVBOX_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_value("DEVBOX_ROUTE_CONFIG") {
            self.route_config_path = PathBuf::from(path);
        }
        if let Some(domain) = env_value("DEVBOX_BASE_DOMAIN") {
            self.base_domain = domain;
        }
        if let Some(dir) = env_value("DEVBOX_HOME_ROOT") {
            self.home_root = PathBuf::from(dir);
        }
        if let Some(dir) = env_value("DEVBOX_UNIT_DIR") {
            self.unit_dir = PathBuf::from(dir);
        }
        if let Some(bin) = env_value("DEVBOX_EDITOR_BIN") {
            self.editor_bin = bin;
        }
        if let Some(dir) = env_value("DEVBOX_TEMPLATE_DIR") {
            self.template_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_domain.trim_matches('.').is_empty() {
            return Err(ProvisionError::InvalidInput(
                "base_domain must not be empty".to_string(),
            ));
        }
        if self.password_length < MIN_PASSWORD_LENGTH {
            return Err(ProvisionError::InvalidInput(format!(
                "password_length must be at least {}",
                MIN_PASSWORD_LENGTH
            )));
        }
        if self.default_action_timeout_secs == 0 {
            return Err(ProvisionError::InvalidInput(
                "default_action_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn port_registry_path(&self) -> PathBuf {
        self.state_dir.join("ports.json")
    }

    pub fn workspace_state_path(&self) -> PathBuf {
        self.state_dir.join("workspaces.yaml")
    }

    pub fn route_settings(&self) -> RouteSettings {
        RouteSettings {
            entry_point: self.entry_point.clone(),
            cert_resolver: self.cert_resolver.clone(),
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            editor_bin: self.editor_bin.clone(),
            database: self.database.clone(),
        }
    }

    pub fn action_timeouts(&self) -> ActionTimeouts {
        self.action_timeouts.iter().fold(
            ActionTimeouts {
                default: Duration::from_secs(self.default_action_timeout_secs),
                ..ActionTimeouts::default()
            },
            |timeouts, (action_type, secs)| {
                timeouts.with_type(*action_type, Duration::from_secs(*secs))
            },
        )
    }
}
