//! Template and action definitions as loaded from YAML.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw action parameters. String leaves may contain `${var}` placeholders.
pub type Params = Map<String, Value>;

/// A reusable, ordered set of setup actions applied to a new workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Multi-root editor workspace file opened by the editor once provisioning finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_file: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Template {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(content)
    }

    pub fn action(&self, id: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: String,
    #[serde(rename = "type", alias = "action_type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub parameters: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_fatal")]
    pub fatal_on_error: bool,
    #[serde(default)]
    pub rollback: RollbackBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_fatal() -> bool {
    true
}

impl ActionDefinition {
    pub fn new(id: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            id: id.into(),
            action_type,
            order: 0,
            parameters: Params::new(),
            condition: None,
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
            fatal_on_error: true,
            rollback: RollbackBehavior::Auto,
            timeout_secs: None,
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal_on_error = false;
        self
    }

    pub fn rollback(mut self, rollback: RollbackBehavior) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Retry policy for `execute`; rollback is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
            ..Default::default()
        }
    }

    /// Delay before attempt `next_attempt` (2 for the first retry).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2) as i32;
        let multiplier = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = (self.backoff_ms as f64 * multiplier).min(self.max_backoff_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackBehavior {
    #[default]
    Auto,
    Skip,
}

/// The closed set of action types a template may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    GenerateSshKey,
    GitClone,
    InstallPackages,
    CreateVenv,
    PipInstall,
    CreateDirectory,
    WriteConfig,
    CreateDatabase,
    InstallExtensions,
    SetEnvVars,
    RunScript,
    CreateService,
    Complete,
}

impl ActionType {
    pub const ALL: [ActionType; 13] = [
        ActionType::GenerateSshKey,
        ActionType::GitClone,
        ActionType::InstallPackages,
        ActionType::CreateVenv,
        ActionType::PipInstall,
        ActionType::CreateDirectory,
        ActionType::WriteConfig,
        ActionType::CreateDatabase,
        ActionType::InstallExtensions,
        ActionType::SetEnvVars,
        ActionType::RunScript,
        ActionType::CreateService,
        ActionType::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::GenerateSshKey => "generate_ssh_key",
            ActionType::GitClone => "git_clone",
            ActionType::InstallPackages => "install_packages",
            ActionType::CreateVenv => "create_venv",
            ActionType::PipInstall => "pip_install",
            ActionType::CreateDirectory => "create_directory",
            ActionType::WriteConfig => "write_config",
            ActionType::CreateDatabase => "create_database",
            ActionType::InstallExtensions => "install_extensions",
            ActionType::SetEnvVars => "set_env_vars",
            ActionType::RunScript => "run_script",
            ActionType::CreateService => "create_service",
            ActionType::Complete => "complete",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown action type: {}", s))
    }
}
