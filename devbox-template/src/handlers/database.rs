use devbox_core::secrets;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ActionError;
use crate::handler::{
    is_templated, validate_params, ActionContext, ActionHandler, ActionResult, Artifact, ParamSpec,
};
use crate::model::{ActionType, Params};

const GENERATED_PASSWORD_LENGTH: usize = 24;

/// Connection settings for the shared database server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// OS account that may administer the server over the local socket.
    pub admin_user: String,
    pub host: String,
    pub port: u16,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            admin_user: "postgres".to_string(),
            host: "localhost".to_string(),
            port: 5432,
        }
    }
}

/// PostgreSQL identifiers handed to SQL: lowercase, no quoting tricks.
fn check_name(kind: &str, name: &str) -> Result<(), ActionError> {
    let mut chars = name.chars();
    let valid = name.len() <= 63
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(ActionError::invalid(format!("invalid {} name '{}'", kind, name)));
    }
    Ok(())
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Creates a PostgreSQL role and a database it owns.
pub struct CreateDatabaseHandler {
    settings: DatabaseSettings,
}

impl CreateDatabaseHandler {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self { settings }
    }

    /// Run SQL as the admin account. Statements go over stdin so passwords stay out
    /// of the process table and logs.
    fn psql(&self, ctx: &ActionContext<'_>, sql: &str) -> Result<String, ActionError> {
        let spec = ctx
            .root_command("psql")
            .run_as(self.settings.admin_user.as_str())
            .args(["-X", "-q", "-tA", "-v", "ON_ERROR_STOP=1", "-d", "postgres"])
            .stdin(sql);
        ctx.run(&spec)
    }

    fn exists(&self, ctx: &ActionContext<'_>, sql: &str) -> Result<bool, ActionError> {
        Ok(self.psql(ctx, sql)?.trim() == "1")
    }
}

impl ActionHandler for CreateDatabaseHandler {
    fn action_type(&self) -> ActionType {
        ActionType::CreateDatabase
    }

    fn required_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::string("name")];
        PARAMS
    }

    fn optional_params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::string("user"),
            ParamSpec::string("password"),
            ParamSpec::string("engine"),
        ];
        PARAMS
    }

    fn provides(&self) -> &'static [&'static str] {
        &["database_url", "database_name", "database_user"]
    }

    fn validate(&self, params: &Params) -> Result<(), ActionError> {
        validate_params(params, self.required_params(), self.optional_params())?;
        if let Some(engine) = params.get("engine").and_then(|v| v.as_str()) {
            if !is_templated(engine) && engine != "postgres" {
                return Err(ActionError::invalid(format!(
                    "unsupported database engine '{}'",
                    engine
                )));
            }
        }
        for (kind, key) in [("database", "name"), ("role", "user")] {
            if let Some(name) = params.get(key).and_then(|v| v.as_str()) {
                if !is_templated(name) {
                    check_name(kind, name)?;
                }
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionResult, ActionError> {
        let engine = ctx.opt_str("engine")?.unwrap_or_else(|| "postgres".to_string());
        if engine != "postgres" {
            return Err(ActionError::invalid(format!("unsupported database engine '{}'", engine)));
        }
        let name = ctx.str_param("name")?;
        let role = ctx.opt_str("user")?.unwrap_or_else(|| name.clone());
        check_name("database", &name)?;
        check_name("role", &role)?;
        let explicit_password = ctx.opt_str("password")?;
        let password = match &explicit_password {
            Some(password) => password.clone(),
            None => ctx
                .vars
                .get("db_password")
                .map(str::to_string)
                .unwrap_or_else(|| secrets::generate(GENERATED_PASSWORD_LENGTH)),
        };

        let role_exists = self.exists(
            ctx,
            &format!("SELECT 1 FROM pg_roles WHERE rolname = {};", sql_literal(&role)),
        )?;
        let mut result = ActionResult::new();
        let mut previous_password = None;
        let url_password = if !role_exists {
            self.psql(
                ctx,
                &format!("CREATE ROLE \"{}\" LOGIN PASSWORD {};", role, sql_literal(&password)),
            )?;
            Some(password)
        } else if explicit_password.is_some() {
            // The stored hash is put back on rollback.
            let hash = self.psql(
                ctx,
                &format!(
                    "SELECT coalesce(rolpassword, '') FROM pg_authid WHERE rolname = {};",
                    sql_literal(&role)
                ),
            )?;
            previous_password = Some(hash.trim().to_string());
            self.psql(
                ctx,
                &format!("ALTER ROLE \"{}\" LOGIN PASSWORD {};", role, sql_literal(&password)),
            )?;
            Some(password)
        } else {
            debug!(role = %role, "Role exists; keeping its password");
            result = result.warning(format!(
                "role '{}' already exists; database_url carries no password",
                role
            ));
            None
        };

        let database_exists = self.exists(
            ctx,
            &format!("SELECT 1 FROM pg_database WHERE datname = {};", sql_literal(&name)),
        )?;
        if database_exists {
            debug!(database = %name, "Database already exists");
        } else if let Err(e) = self.psql(ctx, &format!("CREATE DATABASE \"{}\" OWNER \"{}\";", name, role)) {
            if !role_exists {
                let _ = self.psql(ctx, &format!("DROP ROLE IF EXISTS \"{}\";", role));
            }
            return Err(e);
        }

        info!(database = %name, role = %role, "Database ready");
        let credentials = match &url_password {
            Some(password) => format!("{}:{}", role, password),
            None => role.clone(),
        };
        let url = format!(
            "postgresql://{}@{}:{}/{}",
            credentials, self.settings.host, self.settings.port, name
        );
        Ok(result
            .secret_output("database_url", url)
            .output("database_name", name.clone())
            .output("database_user", role.clone())
            .artifact(Artifact::Database {
                name,
                role,
                created_database: !database_exists,
                created_role: !role_exists,
                previous_password,
            }))
    }

    fn rollback(&self, ctx: &ActionContext<'_>, result: &ActionResult) -> Result<(), ActionError> {
        for artifact in &result.artifacts {
            let Artifact::Database {
                name,
                role,
                created_database,
                created_role,
                previous_password,
            } = artifact
            else {
                continue;
            };
            if *created_database {
                self.psql(ctx, &format!("DROP DATABASE IF EXISTS \"{}\";", name))?;
            }
            if *created_role {
                self.psql(ctx, &format!("DROP ROLE IF EXISTS \"{}\";", role))?;
            } else if let Some(hash) = previous_password {
                let restored = if hash.is_empty() {
                    "NULL".to_string()
                } else {
                    sql_literal(hash)
                };
                self.psql(ctx, &format!("ALTER ROLE \"{}\" PASSWORD {};", role, restored))?;
            }
        }
        Ok(())
    }
}
