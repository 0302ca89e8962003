//! Per-run variables and `${name}` substitution.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// `$${` (escaped literal) or `${name}`, where names may be dotted (`clone.repo_path`).
static PLACEHOLDER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\$\{|\$\{([A-Za-z_][A-Za-z0-9_.]*)\}")
        .expect("Placeholder regex should compile - this is a static pattern")
});

const REDACTED: &str = "<redacted>";

/// Variables visible to a template run.
///
/// Secret values are usable in substitution but never serialized or logged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    vars: BTreeMap<String, String>,
    secrets: BTreeSet<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn insert_secret(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.secrets.insert(key.clone());
        self.vars.insert(key, value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn is_secret(&self, key: &str) -> bool {
        self.secrets.contains(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Publish an action's outputs as `<action_id>.<key>` and `<key>`.
    pub fn add_outputs(
        &mut self,
        action_id: &str,
        outputs: &BTreeMap<String, String>,
        secret_keys: &BTreeSet<String>,
    ) {
        for (key, value) in outputs {
            let qualified = format!("{}.{}", action_id, key);
            if secret_keys.contains(key) {
                self.insert_secret(qualified, value.clone());
                self.insert_secret(key.clone(), value.clone());
            } else {
                self.insert(qualified, value.clone());
                self.insert(key.clone(), value.clone());
            }
        }
    }

    /// Replace every `${name}` in `input`. Fails with the first unresolved name.
    pub fn substitute(&self, input: &str) -> Result<String, String> {
        let mut missing = None;
        let output = PLACEHOLDER_REGEX.replace_all(input, |caps: &Captures<'_>| {
            let Some(name) = caps.get(1) else {
                return "${".to_string();
            };
            match self.vars.get(name.as_str()) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| name.as_str().to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(name) => Err(name),
            None => Ok(output.into_owned()),
        }
    }

    /// Substitute every string leaf of a JSON value.
    pub fn substitute_value(&self, value: &Value) -> Result<Value, String> {
        Ok(match value {
            Value::String(s) => Value::String(self.substitute(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.substitute_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.substitute_value(v)?)))
                    .collect::<Result<_, String>>()?,
            ),
            other => other.clone(),
        })
    }
}

impl Serialize for ExecutionContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.vars.len()))?;
        for (key, value) in &self.vars {
            if self.secrets.contains(key) {
                map.serialize_entry(key, REDACTED)?;
            } else {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

/// Every `${name}` referenced by `input`, excluding escaped `$${...}`.
pub fn references(input: &str) -> Vec<String> {
    PLACEHOLDER_REGEX
        .captures_iter(input)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Every `${name}` referenced in the string leaves of `value`.
pub fn value_references(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => references(s),
        Value::Array(items) => items.iter().flat_map(value_references).collect(),
        Value::Object(map) => map.values().flat_map(value_references).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_username() {
        let ctx = ExecutionContext::new().with("username", "acme_dev1");
        assert_eq!(
            ctx.substitute("/home/${username}/app").unwrap(),
            "/home/acme_dev1/app"
        );
    }

    #[test]
    fn test_unresolved_reference() {
        let ctx = ExecutionContext::new().with("username", "acme_dev1");
        assert_eq!(
            ctx.substitute("/home/${username}/${project}").unwrap_err(),
            "project"
        );
    }

    #[test]
    fn test_escape() {
        let ctx = ExecutionContext::new().with("HOME", "/home/x");
        assert_eq!(ctx.substitute("echo $${HOME} ${HOME}").unwrap(), "echo ${HOME} /home/x");
        assert_eq!(references("echo $${HOME} ${HOME}"), vec!["HOME".to_string()]);
        assert!(references("$${NOT_A_REF}").is_empty());
    }

    #[test]
    fn test_dotted_names() {
        let mut ctx = ExecutionContext::new();
        let outputs = BTreeMap::from([("repo_path".to_string(), "/home/a/app".to_string())]);
        ctx.add_outputs("clone", &outputs, &BTreeSet::new());
        assert_eq!(ctx.substitute("${clone.repo_path}").unwrap(), "/home/a/app");
        assert_eq!(ctx.substitute("${repo_path}/src").unwrap(), "/home/a/app/src");
    }

    #[test]
    fn test_substitute_nested_value() {
        let ctx = ExecutionContext::new().with("port", "8100");
        let value = json!({"vars": {"PORT": "${port}", "DEBUG": true}, "list": ["${port}", 3]});
        assert_eq!(
            ctx.substitute_value(&value).unwrap(),
            json!({"vars": {"PORT": "8100", "DEBUG": true}, "list": ["8100", 3]})
        );
        let mut refs = value_references(&value);
        refs.dedup();
        assert_eq!(refs, vec!["port".to_string()]);
    }

    #[test]
    fn test_secrets_are_redacted() {
        let mut ctx = ExecutionContext::new().with("username", "acme_dev1");
        ctx.insert_secret("db_password", "hunter2");
        assert_eq!(ctx.substitute("${db_password}").unwrap(), "hunter2");

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("<redacted>"));
    }
}
