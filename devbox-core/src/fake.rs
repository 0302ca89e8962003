//! In-memory [`System`] for tests.
//!
//! `FakeSystem` records every command and simulates just enough host behavior for the
//! provisioning stack: a user table (`id`, `useradd`, `userdel`), systemd unit state
//! (`systemctl`, `journalctl`), key generation, clones and virtualenvs. Failures and
//! timeouts can be injected by matching on the rendered command line. File access
//! follows symlinks registered with [`FakeSystem::add_symlink`].

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::system::{CommandOutput, CommandSpec, System, SystemError};

#[derive(Debug, Clone)]
pub enum FakeFailure {
    Exit(i32),
    Timeout,
}

#[derive(Debug)]
struct FailureRule {
    pattern: String,
    failure: FakeFailure,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct FakeState {
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
    modes: BTreeMap<PathBuf, u32>,
    symlinks: BTreeMap<PathBuf, PathBuf>,
    users: BTreeSet<String>,
    enabled_units: BTreeSet<String>,
    active_units: BTreeSet<String>,
    missing_tools: BTreeSet<String>,
    commands: Vec<CommandSpec>,
    failures: Vec<FailureRule>,
    responses: Vec<(String, CommandOutput)>,
}

const DEFAULT_MODE: u32 = 0o644;
const MAX_LINK_DEPTH: u32 = 40;

#[derive(Debug, Default)]
pub struct FakeSystem {
    state: Mutex<FakeState>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every command whose rendered line contains `pattern` exit with `code`.
    pub fn fail_command(&self, pattern: &str, code: i32) {
        self.push_failure(pattern, FakeFailure::Exit(code), None);
    }

    /// Like [`fail_command`](Self::fail_command) but only for the next `times` matches.
    pub fn fail_command_times(&self, pattern: &str, code: i32, times: u32) {
        self.push_failure(pattern, FakeFailure::Exit(code), Some(times));
    }

    pub fn timeout_command(&self, pattern: &str) {
        self.push_failure(pattern, FakeFailure::Timeout, None);
    }

    fn push_failure(&self, pattern: &str, failure: FakeFailure, remaining: Option<u32>) {
        self.state().failures.push(FailureRule {
            pattern: pattern.to_string(),
            failure,
            remaining,
        });
    }

    /// Answer every command whose rendered line or stdin contains `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.state().responses.push((pattern.to_string(), output));
    }

    /// Stdin fed to every command run so far, in order.
    pub fn stdin_log(&self) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter_map(|c| c.stdin.clone())
            .collect()
    }

    pub fn add_user(&self, username: &str) {
        self.state().users.insert(username.to_string());
    }

    pub fn has_user(&self, username: &str) -> bool {
        self.state().users.contains(username)
    }

    pub fn is_unit_active(&self, unit: &str) -> bool {
        self.state().active_units.contains(unit)
    }

    pub fn is_unit_enabled(&self, unit: &str) -> bool {
        self.state().enabled_units.contains(unit)
    }

    pub fn mark_tool_missing(&self, tool: &str) {
        self.state().missing_tools.insert(tool.to_string());
    }

    pub fn put_file(&self, path: impl AsRef<Path>, contents: &str) {
        let mut state = self.state();
        let path = state.resolve(path.as_ref()).unwrap_or_else(|| path.as_ref().to_path_buf());
        if let Some(parent) = path.parent() {
            insert_dir_chain(&mut state.dirs, parent);
        }
        state.files.insert(path, contents.to_string());
    }

    pub fn set_mode(&self, path: impl AsRef<Path>, mode: u32) {
        self.state().modes.insert(path.as_ref().to_path_buf(), mode);
    }

    /// Make `link` a symlink to `target`; a relative target is taken from the link's
    /// directory.
    pub fn add_symlink(&self, link: impl AsRef<Path>, target: impl AsRef<Path>) {
        let link = link.as_ref().to_path_buf();
        let mut state = self.state();
        if let Some(parent) = link.parent() {
            insert_dir_chain(&mut state.dirs, parent);
        }
        state.symlinks.insert(link, target.as_ref().to_path_buf());
    }

    /// Contents stored at exactly `path`, without following links.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state().files.get(path.as_ref()).cloned()
    }

    pub fn has_dir(&self, path: impl AsRef<Path>) -> bool {
        self.state().dirs.contains(path.as_ref())
    }

    /// Every command run so far, rendered as in logs.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.iter().map(|c| c.to_string()).collect()
    }

    pub fn recorded(&self) -> Vec<CommandSpec> {
        self.state().commands.clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    fn injected_failure(state: &mut FakeState, line: &str) -> Option<FakeFailure> {
        let rule = state
            .failures
            .iter_mut()
            .find(|rule| line.contains(&rule.pattern) && rule.remaining != Some(0))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.failure.clone())
    }

    fn simulate(state: &mut FakeState, spec: &CommandSpec) -> CommandOutput {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match spec.program.as_str() {
            "id" => match args.last() {
                Some(user) if state.users.contains(*user) => CommandOutput::ok("1000\n"),
                _ => CommandOutput::exit(1, "").with_stderr("id: no such user\n"),
            },
            "useradd" => {
                let Some(user) = args.last() else {
                    return CommandOutput::exit(2, "").with_stderr("useradd: missing name\n");
                };
                if state.users.contains(*user) {
                    return CommandOutput::exit(9, "")
                        .with_stderr(format!("useradd: user '{user}' already exists\n"));
                }
                state.users.insert(user.to_string());
                if let Some(pos) = args.iter().position(|a| *a == "-d") {
                    if let Some(home) = args.get(pos + 1) {
                        insert_dir_chain(&mut state.dirs, Path::new(home));
                    }
                }
                CommandOutput::ok("")
            }
            "userdel" => match args.last() {
                Some(user) if state.users.remove(*user) => {
                    let home = PathBuf::from(format!("/home/{user}"));
                    remove_tree(state, &home);
                    CommandOutput::ok("")
                }
                _ => CommandOutput::exit(6, "").with_stderr("userdel: user does not exist\n"),
            },
            "systemctl" => Self::simulate_systemctl(state, &args),
            "journalctl" => CommandOutput::ok("editor started\nlistening on 127.0.0.1\n"),
            "ssh-keygen" => {
                if let Some(pos) = args.iter().position(|a| *a == "-f") {
                    if let Some(key) = args.get(pos + 1) {
                        let key = PathBuf::from(key);
                        if let Some(parent) = key.parent() {
                            insert_dir_chain(&mut state.dirs, parent);
                        }
                        state.files.insert(key.clone(), "PRIVATE KEY".to_string());
                        state.files.insert(
                            key.with_extension("pub"),
                            "ssh-ed25519 AAAAC3NzaFAKEKEY devbox\n".to_string(),
                        );
                    }
                }
                CommandOutput::ok("")
            }
            "ssh-keyscan" => CommandOutput::ok("github.com ssh-ed25519 AAAAHOSTKEY\n")
                .with_stderr("# github.com:22 SSH-2.0-babeld-f6a6e2c2\n"),
            "git" if args.first() == Some(&"clone") => {
                if let Some(dest) = args.last() {
                    insert_dir_chain(&mut state.dirs, &Path::new(dest).join(".git"));
                }
                CommandOutput::ok("")
            }
            program if program.starts_with("python") && args.contains(&"venv") => {
                if let Some(dest) = args.last() {
                    let dest = PathBuf::from(dest);
                    insert_dir_chain(&mut state.dirs, &dest.join("bin"));
                    state
                        .files
                        .insert(dest.join("pyvenv.cfg"), "home = /usr/bin\n".to_string());
                }
                CommandOutput::ok("")
            }
            _ => CommandOutput::ok(""),
        }
    }

    fn simulate_systemctl(state: &mut FakeState, args: &[&str]) -> CommandOutput {
        let Some((verb, rest)) = args.split_first() else {
            return CommandOutput::exit(1, "");
        };
        let units: Vec<String> = rest
            .iter()
            .filter(|a| !a.starts_with("--"))
            .map(|a| a.to_string())
            .collect();
        let now = rest.contains(&"--now");
        match *verb {
            "start" | "restart" => {
                state.active_units.extend(units);
                CommandOutput::ok("")
            }
            "stop" => {
                for unit in &units {
                    state.active_units.remove(unit);
                }
                CommandOutput::ok("")
            }
            "enable" => {
                if now {
                    state.active_units.extend(units.iter().cloned());
                }
                state.enabled_units.extend(units);
                CommandOutput::ok("")
            }
            "disable" => {
                for unit in &units {
                    state.enabled_units.remove(unit);
                    if now {
                        state.active_units.remove(unit);
                    }
                }
                CommandOutput::ok("")
            }
            "is-active" => match units.first() {
                Some(unit) if state.active_units.contains(unit) => CommandOutput::ok("active\n"),
                _ => CommandOutput::exit(3, "inactive\n"),
            },
            _ => CommandOutput::ok(""),
        }
    }
}

fn insert_dir_chain(dirs: &mut BTreeSet<PathBuf>, path: &Path) {
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() {
            continue;
        }
        dirs.insert(ancestor.to_path_buf());
    }
}

fn remove_tree(state: &mut FakeState, path: &Path) {
    state.files.retain(|p, _| !p.starts_with(path));
    state.dirs.retain(|p| !p.starts_with(path));
    state.modes.retain(|p, _| !p.starts_with(path));
    state.symlinks.retain(|p, _| !p.starts_with(path));
}

impl FakeState {
    /// Follow registered links through every component of `path`. `None` on a loop.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        self.resolve_at_depth(path, 0)
    }

    fn resolve_at_depth(&self, path: &Path, depth: u32) -> Option<PathBuf> {
        if depth > MAX_LINK_DEPTH {
            return None;
        }
        let mut resolved = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => continue,
                Component::ParentDir => {
                    resolved.pop();
                    continue;
                }
                other => resolved.push(other),
            }
            if let Some(target) = self.symlinks.get(&resolved) {
                let joined = match resolved.parent() {
                    Some(parent) => parent.join(target),
                    None => target.clone(),
                };
                resolved = self.resolve_at_depth(&joined, depth + 1)?;
            }
        }
        Some(resolved)
    }

    /// Like [`resolve`](Self::resolve) but leaves a final link component in place.
    fn resolve_parent(&self, path: &Path) -> Option<PathBuf> {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => Some(self.resolve(parent)?.join(name)),
            _ => Some(path.to_path_buf()),
        }
    }
}

fn link_loop(path: &Path) -> SystemError {
    SystemError::Io {
        path: path.to_path_buf(),
        source: io::Error::other("too many levels of symbolic links"),
    }
}

impl System for FakeSystem {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, SystemError> {
        let mut state = self.state();
        state.commands.push(spec.clone());

        let line = spec.to_string();
        match Self::injected_failure(&mut state, &line) {
            Some(FakeFailure::Exit(code)) => {
                return Ok(CommandOutput::exit(code, "").with_stderr("injected failure\n"));
            }
            Some(FakeFailure::Timeout) => {
                return Err(SystemError::Timeout {
                    command: line,
                    secs: spec.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                });
            }
            None => {}
        }

        let stdin = spec.stdin.as_deref().unwrap_or_default();
        let canned = state
            .responses
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()) || stdin.contains(pattern.as_str()));
        if let Some((_, output)) = canned {
            return Ok(output.clone());
        }

        Ok(Self::simulate(&mut state, spec))
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>, SystemError> {
        let state = self.state();
        let path = state.resolve(path).ok_or_else(|| link_loop(path))?;
        Ok(state.files.get(&path).cloned())
    }

    fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), SystemError> {
        let mut state = self.state();
        let path = state.resolve(path).ok_or_else(|| link_loop(path))?;
        if let Some(parent) = path.parent() {
            insert_dir_chain(&mut state.dirs, parent);
        }
        state.files.insert(path.clone(), contents.to_string());
        state.modes.insert(path, mode);
        Ok(())
    }

    fn file_mode(&self, path: &Path) -> Result<Option<u32>, SystemError> {
        let state = self.state();
        let path = state.resolve(path).ok_or_else(|| link_loop(path))?;
        if !state.files.contains_key(&path) {
            return Ok(None);
        }
        Ok(Some(state.modes.get(&path).copied().unwrap_or(DEFAULT_MODE)))
    }

    fn real_path(&self, path: &Path) -> Result<PathBuf, SystemError> {
        self.state().resolve(path).ok_or_else(|| link_loop(path))
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state();
        match state.resolve(path) {
            Some(path) => state.files.contains_key(&path) || state.dirs.contains(&path),
            None => false,
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SystemError> {
        let mut state = self.state();
        let path = state.resolve(path).ok_or_else(|| link_loop(path))?;
        insert_dir_chain(&mut state.dirs, &path);
        Ok(())
    }

    fn remove_path(&self, path: &Path) -> Result<(), SystemError> {
        let mut state = self.state();
        let path = state.resolve_parent(path).ok_or_else(|| link_loop(path))?;
        if state.symlinks.remove(&path).is_none() {
            remove_tree(&mut state, &path);
        }
        Ok(())
    }

    fn command_available(&self, name: &str) -> bool {
        !self.state().missing_tools.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_table() {
        let system = FakeSystem::new();
        let id = CommandSpec::new("id").args(["-u", "acme_dev1"]);
        assert!(!system.run(&id).unwrap().success());

        let add = CommandSpec::new("useradd").args(["-m", "-d", "/home/acme_dev1", "acme_dev1"]);
        assert!(system.run(&add).unwrap().success());
        assert!(system.run(&id).unwrap().success());
        assert!(system.has_dir("/home/acme_dev1"));

        // duplicate
        assert_eq!(system.run(&add).unwrap().code, Some(9));

        let del = CommandSpec::new("userdel").args(["-r", "acme_dev1"]);
        assert!(system.run(&del).unwrap().success());
        assert!(!system.has_user("acme_dev1"));
        assert!(!system.has_dir("/home/acme_dev1"));
    }

    #[test]
    fn test_systemctl_state() {
        let system = FakeSystem::new();
        let unit = "devbox-editor-acme_dev1.service";
        system
            .run(&CommandSpec::new("systemctl").args(["enable", "--now", unit]))
            .unwrap();
        assert!(system.is_unit_active(unit));
        assert!(system.is_unit_enabled(unit));

        let active = system
            .run(&CommandSpec::new("systemctl").args(["is-active", unit]))
            .unwrap();
        assert_eq!(active.stdout.trim(), "active");

        system
            .run(&CommandSpec::new("systemctl").args(["stop", unit]))
            .unwrap();
        assert!(!system.is_unit_active(unit));
    }

    #[test]
    fn test_failure_injection_is_bounded() {
        let system = FakeSystem::new();
        system.fail_command_times("git clone", 128, 2);
        let clone = CommandSpec::new("git").args(["clone", "https://x/y.git", "/home/a/y"]);

        assert_eq!(system.run(&clone).unwrap().code, Some(128));
        assert_eq!(system.run(&clone).unwrap().code, Some(128));
        assert!(system.run(&clone).unwrap().success());
        assert_eq!(system.count_matching("git clone"), 3);
    }

    #[test]
    fn test_canned_response_matches_stdin() {
        let system = FakeSystem::new();
        system.respond("FROM pg_roles", CommandOutput::ok("1\n"));
        let query = CommandSpec::new("psql").stdin("SELECT 1 FROM pg_roles WHERE rolname = 'a';");
        assert_eq!(system.run_checked(&query).unwrap(), "1\n");
        assert_eq!(system.run_checked(&CommandSpec::new("psql")).unwrap(), "");
        assert_eq!(system.stdin_log().len(), 1);
    }

    #[test]
    fn test_timeout_injection() {
        let system = FakeSystem::new();
        system.timeout_command("sleep");
        let err = system.run(&CommandSpec::new("sleep").arg("10")).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_files() {
        let system = FakeSystem::new();
        let path = Path::new("/home/a/.profile");
        system.write_file(path, "export A=1\n", 0o644).unwrap();
        assert_eq!(system.read_file(path).unwrap().as_deref(), Some("export A=1\n"));
        assert!(system.path_exists(Path::new("/home/a")));
        system.remove_path(Path::new("/home/a")).unwrap();
        assert!(!system.path_exists(path));
    }

    #[test]
    fn test_symlinks_are_followed() {
        let system = FakeSystem::new();
        system.create_dir_all(Path::new("/home/etc_like")).unwrap();
        system.add_symlink("/home/a/cfg", "../etc_like");

        assert_eq!(
            system.real_path(Path::new("/home/a/cfg/app.toml")).unwrap(),
            PathBuf::from("/home/etc_like/app.toml")
        );
        system
            .write_file(Path::new("/home/a/cfg/app.toml"), "x = 1\n", 0o600)
            .unwrap();
        assert_eq!(system.file("/home/etc_like/app.toml").as_deref(), Some("x = 1\n"));
        assert_eq!(
            system.file_mode(Path::new("/home/etc_like/app.toml")).unwrap(),
            Some(0o600)
        );

        // Removing the link leaves its target alone.
        system.remove_path(Path::new("/home/a/cfg")).unwrap();
        assert!(system.file("/home/etc_like/app.toml").is_some());
        assert!(!system.path_exists(Path::new("/home/a/cfg")));
    }

    #[test]
    fn test_symlink_loop_is_an_error() {
        let system = FakeSystem::new();
        system.add_symlink("/home/a/x", "/home/a/y");
        system.add_symlink("/home/a/y", "/home/a/x");
        assert!(system.real_path(Path::new("/home/a/x/file")).is_err());
        assert!(!system.path_exists(Path::new("/home/a/x")));
    }
}
