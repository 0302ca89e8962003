use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::ActionError;
use crate::handler::{validate_params, ActionContext, ActionHandler, ActionResult, Artifact, ParamSpec};
use crate::handlers::remove_artifact_paths;
use crate::model::{ActionType, Params};

/// Hosts whose keys are pre-seeded so the first clone does not prompt.
const KNOWN_GIT_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org"];

const KEY_TYPES: &[&str] = &["ed25519", "rsa", "ecdsa"];

/// Generates the account's SSH identity.
pub struct GenerateSshKeyHandler;

impl ActionHandler for GenerateSshKeyHandler {
    fn action_type(&self) -> ActionType {
        ActionType::GenerateSshKey
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::string("key_type"),
            ParamSpec::string("comment"),
            ParamSpec::bool("known_hosts"),
        ];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["ssh_public_key", "ssh_key_path"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(key_type) = params.get("key_type").and_then(|v| v.as_str()) {
            if !KEY_TYPES.contains(&key_type) {
                return Err(ActionError::invalid(format!(
                    "unsupported key_type '{}' (expected one of {})",
                    key_type,
                    KEY_TYPES.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let key_type = ctx.opt_str("key_type")?.unwrap_or_else(|| "ed25519".to_string());
        if !KEY_TYPES.contains(&key_type.as_str()) {
            return Err(ActionError::invalid(format!("unsupported key_type '{}'", key_type)));
        }
        let comment = ctx
            .opt_str("comment")?
            .unwrap_or_else(|| format!("{}@devbox", ctx.username));

        let ssh_dir = ctx.home_dir.join(".ssh");
        let key_path = ssh_dir.join(format!("id_{}", key_type));
        let pub_path = PathBuf::from(format!("{}.pub", key_path.display()));
        let mut result = ActionResult::new();

        if ctx.system.path_exists(&key_path) {
            debug!(key = %key_path.display(), "SSH key already present");
        } else {
            ctx.run(
                &ctx.user_command("install")
                    .args(["-d", "-m", "700"])
                    .arg(ssh_dir.to_string_lossy()),
            )?;

            let mut keygen = ctx
                .user_command("ssh-keygen")
                .args(["-q", "-t", key_type.as_str()])
                .args(["-N", "", "-C", comment.as_str(), "-f"])
                .arg(key_path.to_string_lossy());
            if key_type == "rsa" {
                keygen = keygen.args(["-b", "4096"]);
            }
            ctx.run(&keygen)?;
            result = result
                .artifact(Artifact::Path {
                    path: key_path.clone(),
                })
                .artifact(Artifact::Path {
                    path: pub_path.clone(),
                });
        }

        if ctx.opt_bool("known_hosts")?.unwrap_or(true) {
            if let Err(e) = seed_known_hosts(ctx, &ssh_dir.join("known_hosts")) {
                warn!(action_id = ctx.action_id, error = %e, "Could not seed known_hosts");
                result = result.warning(format!("known_hosts not seeded: {}", e));
            }
        }

        let public_key = ctx
            .system
            .read_file(&ctx.confine(&pub_path)?)?
            .ok_or_else(|| ActionError::failed(format!("{} missing after keygen", pub_path.display())))?;

        Ok(result
            .output("ssh_public_key", public_key.trim())
            .output("ssh_key_path", key_path.to_string_lossy()))
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        remove_artifact_paths(ctx, result)
    }
}

/// Append host keys not already trusted to `known_hosts`.
fn seed_known_hosts(ctx: &ActionContext<'_>, path: &std::path::Path) -> Result<(), ActionError> {
    let scanned = ctx.run(
        &ctx.user_command("ssh-keyscan")
            .args(["-T", "10", "-t", "ed25519,rsa"])
            .args(KNOWN_GIT_HOSTS.iter().copied()),
    )?;

    let real = ctx.confine(path)?;
    let existing = ctx.system.read_file(&real)?.unwrap_or_default();
    let mut content = existing.clone();
    for line in scanned.lines().filter(|l| is_host_key_line(l)) {
        if !existing.lines().any(|known| known == line) {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(line);
            content.push('\n');
        }
    }

    if content != existing {
        ctx.write_home_file(path, &content, 0o644)?;
    }
    Ok(())
}

/// `host keytype base64-key`, the only shape worth trusting from ssh-keyscan.
fn is_host_key_line(line: &str) -> bool {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        [host, key_type, key] => {
            !host.starts_with('#')
                && (key_type.starts_with("ssh-") || key_type.starts_with("ecdsa-"))
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        }
        _ => false,
    }
}
