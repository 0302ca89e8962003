//! Workspace persistence.
//!
//! [`FileWorkspaceRepository`] keeps every record in one YAML state file. Writes follow
//! the same discipline as the port registry: in-process mutex, exclusive `fs2` lock on
//! a sibling `.lock` file, temp file + atomic rename.

// Standard library
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

// External crates
use anyhow::Context;
use devbox_core::{ProvisionError, Result};
use fs2::FileExt;
use tracing::debug;

// Internal imports
use crate::workspace::{Workspace, WorkspaceStatus};

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

type Records = BTreeMap<String, Workspace>;

/// Storage for workspace records.
pub trait WorkspaceRepository: Send + Sync {
    fn load_workspace(&self, id: &str) -> Result<Option<Workspace>>;

    /// Insert or replace the record with the workspace's id.
    fn save_workspace(&self, workspace: &Workspace) -> Result<()>;

    /// Returns `false` if there was no such record.
    fn delete_workspace(&self, id: &str) -> Result<bool>;

    /// Workspaces whose editor is expected to be up (`Active`).
    fn list_active_workspaces(&self) -> Result<Vec<Workspace>> {
        Ok(self
            .list_workspaces()?
            .into_iter()
            .filter(|w| w.status == WorkspaceStatus::Active)
            .collect())
    }

    fn list_workspaces(&self) -> Result<Vec<Workspace>>;
}

#[derive(Debug, Default)]
pub struct InMemoryWorkspaceRepository {
    records: RwLock<Records>,
}

impl InMemoryWorkspaceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkspaceRepository for InMemoryWorkspaceRepository {
    fn load_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        Ok(records.get(id).cloned())
    }

    fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    fn delete_workspace(&self, id: &str) -> Result<bool> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        Ok(records.remove(id).is_some())
    }

    fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        Ok(records.values().cloned().collect())
    }
}

/// Records in a YAML file shared by every process using the same state directory.
#[derive(Debug)]
pub struct FileWorkspaceRepository {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

fn persistence(err: anyhow::Error) -> ProvisionError {
    ProvisionError::Persistence(format!("{err:#}"))
}

impl FileWorkspaceRepository {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create state directory: {:?}", parent))
                    .map_err(persistence)?;
            }
        }
        Ok(Self {
            path,
            lock_path,
            guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_records(&self) -> anyhow::Result<Records> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Records::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read workspace state: {:?}", self.path))
            }
        };
        if content.trim().is_empty() {
            return Ok(Records::new());
        }
        serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse workspace state: {:?}", self.path))
    }

    fn atomic_update<T, F>(&self, update_fn: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Records) -> T,
    {
        let _in_process = self
            .guard
            .lock()
            .map_err(|_| anyhow::anyhow!("Workspace repository mutex poisoned"))?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", self.lock_path))?;

        let lock_start = Instant::now();
        while let Err(e) = lock_file.try_lock_exclusive() {
            if lock_start.elapsed() > LOCK_TIMEOUT {
                anyhow::bail!(
                    "Timeout waiting for exclusive lock on {:?}: {}",
                    self.lock_path,
                    e
                );
            }
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
        let _unlock = scopeguard::guard((), |_| {
            let _ = lock_file.unlock();
        });

        let mut records = self.read_records()?;
        let before = records.clone();
        let result = update_fn(&mut records);

        if records != before {
            let yaml = serde_yaml_ng::to_string(&records)
                .with_context(|| "Failed to serialize workspace state")?;
            let temp_path = self
                .path
                .with_extension(format!("yaml.tmp.{}", std::process::id()));
            fs::write(&temp_path, yaml)
                .with_context(|| format!("Failed to write temporary file: {:?}", temp_path))?;
            fs::rename(&temp_path, &self.path)
                .with_context(|| "Failed to atomically rename workspace state")?;
            debug!(path = %self.path.display(), records = records.len(), "Saved workspace state");
        }
        Ok(result)
    }
}

impl WorkspaceRepository for FileWorkspaceRepository {
    fn load_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        let mut records = self.read_records().map_err(persistence)?;
        Ok(records.remove(id))
    }

    fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        self.atomic_update(|records| {
            records.insert(workspace.id.clone(), workspace.clone());
        })
        .map_err(persistence)
    }

    fn delete_workspace(&self, id: &str) -> Result<bool> {
        self.atomic_update(|records| records.remove(id).is_some())
            .map_err(persistence)
    }

    fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        Ok(self
            .read_records()
            .map_err(persistence)?
            .into_values()
            .collect())
    }
}
