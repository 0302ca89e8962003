//! The OS capability seam.
//!
//! Every subprocess and filesystem mutation performed on behalf of a workspace goes
//! through [`System`]. Production code uses [`HostSystem`]; tests inject the in-memory
//! fake from the `fake` module so orchestration logic runs without touching the host.

// Standard library
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

// External crates
use duct::cmd;
use thiserror::Error;
use tracing::debug;
use which::which;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines of command output kept in a [`SystemError::Failed`].
const ERROR_CONTEXT_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("'{command}' exited with code {code:?}: {output}")]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SystemError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SystemError::Timeout { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        SystemError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A command to run, optionally as another account and with a deadline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub run_as: Option<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Feed `input` on stdin. Stdin is never included in logs or error messages.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The argv actually executed, with the `runuser` wrapper applied.
    pub fn argv(&self) -> (String, Vec<String>) {
        match &self.run_as {
            Some(user) => {
                let mut args = vec!["-u".to_string(), user.clone(), "--".to_string()];
                args.push(self.program.clone());
                args.extend(self.args.iter().cloned());
                ("runuser".to_string(), args)
            }
            None => (self.program.clone(), self.args.clone()),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.run_as {
            write!(f, "[{}] ", user)?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Exit status and captured output of a finished command.
///
/// `stdout` is what callers parse; `stderr` is kept apart and only surfaces in error
/// context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last `lines` lines of stdout followed by stderr, for error context.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stdout.lines().chain(self.stderr.lines()).collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Privileged OS operations used by the provisioning stack.
pub trait System: Send + Sync {
    /// Run a command to completion. A non-zero exit is returned as `Ok`; only spawn
    /// failures and timeouts are errors.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, SystemError>;

    /// Read a file, `None` if it does not exist.
    fn read_file(&self, path: &Path) -> Result<Option<String>, SystemError>;

    /// Replace a file's contents atomically and set its permission bits.
    fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), SystemError>;

    /// Permission bits of an existing file, `None` if it does not exist.
    fn file_mode(&self, path: &Path) -> Result<Option<u32>, SystemError>;

    /// `path` with every symlink in its existing prefix resolved. Components that do
    /// not exist yet are appended as given. A dangling link is an error.
    fn real_path(&self, path: &Path) -> Result<PathBuf, SystemError>;

    fn path_exists(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> Result<(), SystemError>;

    /// Remove a file or directory tree. Absent paths are not an error.
    fn remove_path(&self, path: &Path) -> Result<(), SystemError>;

    /// Whether an executable is on `PATH`.
    fn command_available(&self, name: &str) -> bool;

    /// Run a command and fail on a non-zero exit, returning its output.
    fn run_checked(&self, spec: &CommandSpec) -> Result<String, SystemError> {
        let output = self.run(spec)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(SystemError::Failed {
                command: spec.to_string(),
                code: output.code,
                output: output.tail(ERROR_CONTEXT_LINES),
            })
        }
    }

    /// Hand a path (recursively, if asked) to an account.
    fn set_owner(&self, path: &Path, owner: &str, recursive: bool) -> Result<(), SystemError> {
        let mut spec = CommandSpec::new("chown");
        if recursive {
            spec = spec.arg("-R");
        }
        let spec = spec
            .arg(format!("{owner}:{owner}"))
            .arg(path.to_string_lossy());
        self.run_checked(&spec).map(|_| ())
    }
}

/// [`System`] backed by the real host, running commands through `duct`.
#[derive(Debug, Default, Clone)]
pub struct HostSystem;

impl HostSystem {
    pub fn new() -> Self {
        Self
    }
}

impl System for HostSystem {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, SystemError> {
        let (program, args) = spec.argv();
        let command_line = spec.to_string();
        debug!(command = %command_line, "Running command");

        let mut expression = cmd(program.as_str(), &args)
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        for (key, value) in &spec.env {
            expression = expression.env(key, value);
        }
        if let Some(dir) = &spec.cwd {
            expression = expression.dir(dir);
        }
        if let Some(input) = &spec.stdin {
            expression = expression.stdin_bytes(input.clone().into_bytes());
        }

        let handle = expression.start().map_err(|source| SystemError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let started = Instant::now();
        loop {
            if let Some(timeout) = spec.timeout {
                if started.elapsed() >= timeout {
                    let _ = handle.kill();
                    return Err(SystemError::Timeout {
                        command: command_line,
                        secs: timeout.as_secs(),
                    });
                }
            }

            match handle.try_wait() {
                Ok(Some(output)) => {
                    return Ok(CommandOutput {
                        code: output.status.code(),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    return Err(SystemError::Spawn {
                        command: command_line,
                        source,
                    });
                }
            }
        }
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>, SystemError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SystemError::io(path, e)),
        }
    }

    fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), SystemError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SystemError::io(parent, e))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()));
        fs::write(&temp_path, contents).map_err(|e| SystemError::io(&temp_path, e))?;
        set_mode(&temp_path, mode)?;
        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            SystemError::io(path, e)
        })
    }

    fn file_mode(&self, path: &Path) -> Result<Option<u32>, SystemError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(mode_bits(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SystemError::io(path, e)),
        }
    }

    fn real_path(&self, path: &Path) -> Result<PathBuf, SystemError> {
        let mut existing = path;
        let mut missing = Vec::new();
        loop {
            match fs::symlink_metadata(existing) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    match (existing.parent(), existing.file_name()) {
                        (Some(parent), Some(name)) => {
                            missing.push(name.to_os_string());
                            existing = parent;
                        }
                        _ => break,
                    }
                }
                Err(e) => return Err(SystemError::io(existing, e)),
            }
        }

        let mut resolved = fs::canonicalize(existing).map_err(|e| SystemError::io(existing, e))?;
        for name in missing.iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SystemError> {
        fs::create_dir_all(path).map_err(|e| SystemError::io(path, e))
    }

    fn remove_path(&self, path: &Path) -> Result<(), SystemError> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| SystemError::io(path, e))
    }

    fn command_available(&self, name: &str) -> bool {
        which(name).is_ok()
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), SystemError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| SystemError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), SystemError> {
    Ok(())
}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
