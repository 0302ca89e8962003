use tracing::info;

use crate::error::ActionError;
use crate::handler::{validate_params, ActionContext, ActionHandler, ActionResult, Artifact, ParamSpec};
use crate::model::{ActionType, Params};

const BLOCK_START: &str = "# >>> devbox managed environment >>>";
const BLOCK_END: &str = "# <<< devbox managed environment <<<";
const PROFILE_MODE: u32 = 0o644;

fn check_var_name(name: &str) -> Result<(), ActionError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(ActionError::invalid(format!(
            "invalid environment variable name '{}'",
            name
        )));
    }
    Ok(())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// `content` without the managed block.
pub(crate) fn strip_block(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut inside = false;
    for line in content.lines() {
        if line == BLOCK_START {
            inside = true;
            continue;
        }
        if line == BLOCK_END {
            inside = false;
            continue;
        }
        if !inside {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn render_block(vars: &[(String, String)]) -> String {
    let mut block = format!("{}\n", BLOCK_START);
    for (name, value) in vars {
        block.push_str(&format!("export {}={}\n", name, shell_quote(value)));
    }
    block.push_str(BLOCK_END);
    block.push('\n');
    block
}

/// Maintains exported variables in a delimited block of the account's shell profile.
pub struct SetEnvVarsHandler;

impl ActionHandler for SetEnvVarsHandler {
    fn action_type(&self) -> ActionType {
        ActionType::SetEnvVars
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::map("vars")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("profile")];
        PARAMS
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(vars) = params.get("vars").and_then(|v| v.as_object()) {
            for name in vars.keys() {
                check_var_name(name)?;
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let vars: Vec<(String, String)> = ctx.map_param("vars")?.into_iter().collect();
        for (name, _) in &vars {
            check_var_name(name)?;
        }
        let profile = match ctx.opt_home_path("profile")? {
            Some(path) => path,
            None => ctx.home_dir.join(".profile"),
        };

        let real = ctx.confine(&profile)?;
        let existing = ctx.system.read_file(&real)?;
        let mode = ctx.system.file_mode(&real)?.unwrap_or(PROFILE_MODE);
        let mut content = strip_block(existing.as_deref().unwrap_or_default());
        if !content.is_empty() && !content.ends_with("\n\n") {
            content.push('\n');
        }
        content.push_str(&render_block(&vars));

        ctx.write_home_file(&profile, &content, mode)?;
        info!(profile = %profile.display(), count = vars.len(), "Updated environment block");

        let artifact = match existing {
            None => Artifact::Path { path: profile },
            Some(_) => Artifact::ProfileBlock { path: profile },
        };
        Ok(ActionResult::new().artifact(artifact))
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        for artifact in &result.artifacts {
            match artifact {
                Artifact::Path { path } => ctx.remove_home_path(path)?,
                Artifact::ProfileBlock { path } => {
                    let real = ctx.confine(path)?;
                    if let Some(content) = ctx.system.read_file(&real)? {
                        let stripped = strip_block(&content);
                        let stripped = stripped.trim_end_matches('\n');
                        let restored = if stripped.is_empty() {
                            String::new()
                        } else {
                            format!("{}\n", stripped)
                        };
                        let mode = ctx.system.file_mode(&real)?.unwrap_or(PROFILE_MODE);
                        ctx.write_home_file(path, &restored, mode)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_is_replaced_not_appended() {
        let vars = vec![("APP_ENV".to_string(), "dev".to_string())];
        let first = format!("export PATH=$PATH:~/bin\n\n{}", render_block(&vars));
        let vars = vec![("APP_ENV".to_string(), "prod".to_string())];
        let second = format!("{}\n{}", strip_block(&first).trim_end(), render_block(&vars));

        assert_eq!(second.matches(BLOCK_START).count(), 1);
        assert!(second.contains("export APP_ENV='prod'"));
        assert!(!second.contains("'dev'"));
        assert!(second.starts_with("export PATH=$PATH:~/bin\n"));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(shell_quote("it's $HOME"), r#"'it'\''s $HOME'"#);
    }

    #[test]
    fn test_var_names() {
        assert!(check_var_name("DATABASE_URL").is_ok());
        assert!(check_var_name("_x1").is_ok());
        assert!(check_var_name("1X").is_err());
        assert!(check_var_name("A-B").is_err());
        assert!(check_var_name("A;rm").is_err());
    }
}
