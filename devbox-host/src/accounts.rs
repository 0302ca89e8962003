//! Linux account lifecycle for workspaces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use devbox_core::validation::validate_username;
use devbox_core::{CommandSpec, ProvisionError, Result, System};
use tracing::{debug, info, instrument, warn};

/// `userdel` exit code for "user does not exist".
const USERDEL_NO_SUCH_USER: i32 = 6;

/// Blocks of 1 KiB per GB, as `setquota` expects.
const BLOCKS_PER_GB: u64 = 1024 * 1024;

/// Creates and removes the OS accounts that own workspaces.
pub struct AccountManager {
    system: Arc<dyn System>,
    home_root: PathBuf,
    shell: String,
}

impl AccountManager {
    pub fn new(system: Arc<dyn System>, home_root: impl Into<PathBuf>) -> Self {
        Self {
            system,
            home_root: home_root.into(),
            shell: "/bin/bash".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn home_root(&self) -> &Path {
        &self.home_root
    }

    pub fn home_dir(&self, username: &str) -> PathBuf {
        self.home_root.join(username)
    }

    pub fn account_exists(&self, username: &str) -> Result<bool> {
        let output = self
            .system
            .run(&CommandSpec::new("id").args(["-u", username]))?;
        Ok(output.success())
    }

    /// Create `username` with a home directory and login shell, then set its password.
    ///
    /// An existing account is an error: the caller derived the name and expects to own it.
    #[instrument(skip(self, password))]
    pub fn create_account(&self, username: &str, password: &str) -> Result<()> {
        let fail = |reason: String| ProvisionError::AccountCreation {
            username: username.to_string(),
            reason,
        };

        validate_username(username).map_err(|e| fail(e.to_string()))?;
        if self.account_exists(username)? {
            return Err(fail("account already exists".to_string()));
        }

        let home = self.home_dir(username);
        let useradd = CommandSpec::new("useradd")
            .args(["-m", "-d"])
            .arg(home.to_string_lossy())
            .args(["-s", self.shell.as_str(), "-U", username]);
        self.system
            .run_checked(&useradd)
            .map_err(|e| fail(e.to_string()))?;

        let chpasswd = CommandSpec::new("chpasswd").stdin(format!("{username}:{password}\n"));
        if let Err(e) = self.system.run_checked(&chpasswd) {
            // Leave nothing half-created behind.
            let _ = self.remove_account(username);
            return Err(fail(format!("setting password: {e}")));
        }

        info!(username, home = %home.display(), "Created account");
        Ok(())
    }

    /// Kill the account's processes and remove it with its home directory.
    ///
    /// Returns `false` if the account was already absent.
    #[instrument(skip(self))]
    pub fn delete_account(&self, username: &str) -> Result<bool> {
        validate_username(username)?;
        if !self.account_exists(username)? {
            debug!(username, "Account already absent");
            return Ok(false);
        }
        self.remove_account(username)?;
        info!(username, "Deleted account");
        Ok(true)
    }

    fn remove_account(&self, username: &str) -> Result<()> {
        // pkill exits 1 when nothing matched.
        self.system
            .run(&CommandSpec::new("pkill").args(["-KILL", "-u", username]))?;

        let output = self
            .system
            .run(&CommandSpec::new("userdel").args(["-r", username]))?;
        match output.code {
            Some(0) => Ok(()),
            Some(USERDEL_NO_SUCH_USER) => Ok(()),
            code => Err(ProvisionError::Service(format!(
                "userdel {} exited with {:?}: {}",
                username,
                code,
                output.tail(5)
            ))),
        }
    }

    /// Apply a block quota of `gb` gigabytes to the account on every quota-enabled
    /// filesystem.
    ///
    /// Returns `Ok(false)` when no quota is requested or the host has no quota tooling;
    /// the workspace then runs unenforced.
    #[instrument(skip(self))]
    pub fn apply_disk_quota(&self, username: &str, gb: u32) -> Result<bool> {
        if gb == 0 {
            return Ok(false);
        }
        if !self.system.command_available("setquota") {
            warn!(username, "setquota not available; disk quota not enforced");
            return Ok(false);
        }

        let soft = u64::from(gb) * BLOCKS_PER_GB;
        let hard = soft + soft / 10;
        let setquota = CommandSpec::new("setquota").args([
            "-u".to_string(),
            username.to_string(),
            soft.to_string(),
            hard.to_string(),
            "0".to_string(),
            "0".to_string(),
            "-a".to_string(),
        ]);
        self.system
            .run_checked(&setquota)
            .map_err(|e| ProvisionError::QuotaApplication {
                username: username.to_string(),
                reason: e.to_string(),
            })?;

        info!(username, gb, "Applied disk quota");
        Ok(true)
    }
}
