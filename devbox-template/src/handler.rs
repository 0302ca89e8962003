//! The contract every action type implements, plus the per-call context handed to it.

// Standard library
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

// External crates
use devbox_core::{CommandSpec, System, SystemError};
use serde::Serialize;
use serde_json::Value;

// Internal imports
use crate::context::ExecutionContext;
use crate::error::ActionError;
use crate::model::{ActionType, Params};

/// Accepted JSON shape of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Bool,
    Integer,
    /// A list of strings; a single string is accepted as a one-element list.
    List,
    /// A mapping of names to scalar values.
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub const fn string(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::String,
        }
    }

    pub const fn bool(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Bool,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Integer,
        }
    }

    pub const fn list(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::List,
        }
    }

    pub const fn map(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Map,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        // Strings are accepted everywhere scalar so `${var}` can fill any slot.
        match self.kind {
            ParamKind::String => matches!(value, Value::String(_) | Value::Number(_)),
            ParamKind::Bool => matches!(value, Value::Bool(_) | Value::String(_)),
            ParamKind::Integer => matches!(value, Value::Number(_) | Value::String(_)),
            ParamKind::List => match value {
                Value::String(_) => true,
                Value::Array(items) => items.iter().all(is_scalar),
                _ => false,
            },
            ParamKind::Map => match value {
                Value::Object(map) => map.values().all(is_scalar),
                _ => false,
            },
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Something an action created, recorded so `rollback` can undo exactly that.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// A file or directory tree that did not exist before.
    Path { path: PathBuf },
    /// A file that was overwritten; `previous` and its permission bits are restored on
    /// rollback.
    ReplacedFile {
        path: PathBuf,
        previous: String,
        mode: u32,
    },
    /// A delimited block added to a shell profile.
    ProfileBlock { path: PathBuf },
    Database {
        name: String,
        role: String,
        created_database: bool,
        created_role: bool,
        /// Stored hash of a pre-existing role whose password was reset; empty for none.
        #[serde(skip)]
        previous_password: Option<String>,
    },
    Service { name: String },
}

/// What a handler reports back from `execute`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionResult {
    pub outputs: BTreeMap<String, String>,
    /// Output keys whose values must never be logged.
    pub secret_outputs: BTreeSet<String>,
    pub warnings: Vec<String>,
    /// The handler found nothing to do and did nothing.
    pub skipped: bool,
    pub artifacts: Vec<Artifact>,
}

impl ActionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, key: &str, value: impl Into<String>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn secret_output(mut self, key: &str, value: impl Into<String>) -> Self {
        self.secret_outputs.insert(key.to_string());
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn skipped(warning: impl Into<String>) -> Self {
        Self {
            skipped: true,
            warnings: vec![warning.into()],
            ..Default::default()
        }
    }

    /// Outputs with secret values replaced, for reports.
    pub fn redacted_outputs(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .map(|(k, v)| {
                let value = if self.secret_outputs.contains(k) {
                    "<redacted>".to_string()
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Everything a handler may use for one invocation.
pub struct ActionContext<'a> {
    pub action_id: &'a str,
    /// Parameters after `${var}` substitution.
    pub params: &'a Params,
    pub vars: &'a ExecutionContext,
    pub username: &'a str,
    pub home_dir: &'a Path,
    pub system: &'a dyn System,
    pub deadline: Instant,
}

impl<'a> ActionContext<'a> {
    /// Time left before the attempt times out.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// A command run as the workspace account from its home directory.
    pub fn user_command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program)
            .run_as(self.username)
            .cwd(self.home_dir)
            .env("HOME", self.home_dir.to_string_lossy())
            .timeout(self.remaining())
    }

    /// A privileged command bounded by the attempt deadline.
    pub fn root_command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.remaining())
    }

    /// Run a command and fail on a non-zero exit.
    pub fn run(&self, spec: &CommandSpec) -> Result<String, ActionError> {
        if self.remaining().is_zero() {
            return Err(ActionError::Timeout {
                secs: spec.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        }
        Ok(self.system.run_checked(spec)?)
    }

    pub fn has(&self, name: &str) -> bool {
        self.params.get(name).is_some_and(|v| !v.is_null())
    }

    pub fn str_param(&self, name: &str) -> Result<String, ActionError> {
        self.opt_str(name)?
            .ok_or_else(|| ActionError::invalid(format!("missing parameter '{}'", name)))
    }

    pub fn opt_str(&self, name: &str) -> Result<Option<String>, ActionError> {
        match self.params.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(ActionError::invalid(format!(
                "parameter '{}' must be a string, got {}",
                name, other
            ))),
        }
    }

    pub fn opt_bool(&self, name: &str) -> Result<Option<bool>, ActionError> {
        match self.params.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" | "" => Ok(Some(false)),
                _ => Err(ActionError::invalid(format!(
                    "parameter '{}' must be a boolean, got '{}'",
                    name, s
                ))),
            },
            Some(other) => Err(ActionError::invalid(format!(
                "parameter '{}' must be a boolean, got {}",
                name, other
            ))),
        }
    }

    pub fn opt_u64(&self, name: &str) -> Result<Option<u64>, ActionError> {
        let invalid = |v: &dyn std::fmt::Display| {
            ActionError::invalid(format!(
                "parameter '{}' must be a non-negative integer, got {}",
                name, v
            ))
        };
        match self.params.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| invalid(n)),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid(s)),
            Some(other) => Err(invalid(other)),
        }
    }

    /// A list parameter; absent means empty.
    pub fn list_param(&self, name: &str) -> Result<Vec<String>, ActionError> {
        match self.params.get(name) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(_) | Value::Bool(_) => Ok(item.to_string()),
                    other => Err(ActionError::invalid(format!(
                        "parameter '{}' must contain strings, got {}",
                        name, other
                    ))),
                })
                .collect(),
            Some(other) => Err(ActionError::invalid(format!(
                "parameter '{}' must be a list, got {}",
                name, other
            ))),
        }
    }

    /// A map parameter with scalar values rendered as strings; absent means empty.
    pub fn map_param(&self, name: &str) -> Result<BTreeMap<String, String>, ActionError> {
        match self.params.get(name) {
            None | Some(Value::Null) => Ok(BTreeMap::new()),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    Value::Number(_) | Value::Bool(_) => Ok((k.clone(), v.to_string())),
                    other => Err(ActionError::invalid(format!(
                        "parameter '{}.{}' must be a scalar, got {}",
                        name, k, other
                    ))),
                })
                .collect(),
            Some(other) => Err(ActionError::invalid(format!(
                "parameter '{}' must be a mapping, got {}",
                name, other
            ))),
        }
    }

    /// A path parameter, required to be absolute and inside the account's home.
    pub fn home_path(&self, name: &str) -> Result<PathBuf, ActionError> {
        let raw = self.str_param(name)?;
        resolve_in_home(self.home_dir, &raw)
            .map_err(|reason| ActionError::invalid(format!("parameter '{}': {}", name, reason)))
    }

    pub fn opt_home_path(&self, name: &str) -> Result<Option<PathBuf>, ActionError> {
        if !self.has(name) {
            return Ok(None);
        }
        self.home_path(name).map(Some)
    }

    /// Hand a path created as root to the account.
    pub fn chown(&self, path: &Path, recursive: bool) -> Result<(), ActionError> {
        Ok(self.system.set_owner(path, self.username, recursive)?)
    }

    /// Where `path` really lands once symlinks are followed. Anything that resolves
    /// outside the account's home is refused. Root file operations use the returned path.
    pub fn confine(&self, path: &Path) -> Result<PathBuf, ActionError> {
        let unresolvable = |e: SystemError| {
            ActionError::invalid(format!("cannot resolve {}: {}", path.display(), e))
        };
        let home = self.system.real_path(self.home_dir).map_err(unresolvable)?;
        let real = self.system.real_path(path).map_err(unresolvable)?;
        if !real.starts_with(&home) {
            return Err(ActionError::invalid(format!(
                "{} resolves to {}, outside the home directory",
                path.display(),
                real.display()
            )));
        }
        Ok(real)
    }

    /// Write a file as root inside the home directory and give it to the account.
    pub fn write_home_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), ActionError> {
        let real = self.confine(path)?;
        self.system.write_file(&real, contents, mode)?;
        self.chown(&real, false)
    }

    /// Remove a file or tree inside the home directory. A final symlink component is
    /// removed itself, never its target.
    pub fn remove_home_path(&self, path: &Path) -> Result<(), ActionError> {
        let target = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => self.confine(parent)?.join(name),
            _ => {
                return Err(ActionError::invalid(format!(
                    "refusing to remove {}",
                    path.display()
                )))
            }
        };
        Ok(self.system.remove_path(&target)?)
    }
}

/// Lexically normalize `raw` and require it to stay within `home`.
///
/// Symlinks are not resolved here. Handlers that touch the path as root go through
/// [`ActionContext::confine`] as well.
pub fn resolve_in_home(home: &Path, raw: &str) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(format!("'{}' is not an absolute path", raw));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => normalized.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    if !normalized.starts_with(home) {
        return Err(format!(
            "'{}' is outside the home directory {}",
            raw,
            home.display()
        ));
    }
    Ok(normalized)
}

/// One action type's validate/execute/rollback implementation.
pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> ActionType;

    fn required_params(&self) -> &'static [ParamSpec];

    fn optional_params(&self) -> &'static [ParamSpec] {
        &[]
    }

    /// Output keys published into the execution context on success.
    fn provides(&self) -> &'static [&'static str] {
        &[]
    }

    /// Check raw (pre-substitution) parameters. Must not touch the system.
    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError>;

    /// Undo what `execute` reported in `result`. Only called after a fatal abort.
    fn rollback(&self, _ctx: &ActionContext<'_>, _result: &ActionResult) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Required parameters present, no unknown parameters, every value of an accepted shape.
pub fn validate_params(
    params: &Params,
    required: &[ParamSpec],
    optional: &[ParamSpec],
) -> Result<(), ActionError> {
    for spec in required {
        match params.get(spec.name) {
            None | Some(Value::Null) => {
                return Err(ActionError::invalid(format!(
                    "missing required parameter '{}'",
                    spec.name
                )))
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                return Err(ActionError::invalid(format!(
                    "parameter '{}' must not be empty",
                    spec.name
                )))
            }
            _ => {}
        }
    }

    for (name, value) in params {
        let Some(spec) = required.iter().chain(optional).find(|s| s.name == name) else {
            return Err(ActionError::invalid(format!("unknown parameter '{}'", name)));
        };
        if !value.is_null() && !spec.accepts(value) {
            return Err(ActionError::invalid(format!(
                "parameter '{}' has the wrong type",
                name
            )));
        }
    }
    Ok(())
}

/// Whether a raw parameter still awaits substitution; such values are checked at run time.
pub fn is_templated(value: &str) -> bool {
    value.contains("${")
}
