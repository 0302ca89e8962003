//! Port allocation backed by a shared registry file.
//!
//! The registry maps each held port to the workspace that owns it. Every mutation is a
//! locked read-modify-write: an in-process mutex serializes threads, an exclusive `fs2`
//! lock on a sibling `.lock` file serializes processes, and the new registry is written
//! to a temporary file and renamed into place.

// Standard library
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// External crates
use anyhow::{Context, Result};
use devbox_core::{ProvisionError, Result as ProvisionResult};
use fs2::FileExt;
use tracing::{debug, info};

// Internal imports
use crate::range::PortRange;

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

type Allocations = BTreeMap<u16, String>;

/// Issues unique ports from a fixed range.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    registry_path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl PortAllocator {
    /// Bind an allocator to `registry_path`, creating an empty registry if needed.
    pub fn open(registry_path: impl Into<PathBuf>, range: PortRange) -> ProvisionResult<Self> {
        let registry_path = registry_path.into();
        let lock_path = registry_path.with_extension("lock");
        let allocator = Self {
            range,
            registry_path,
            lock_path,
            guard: Mutex::new(()),
        };
        allocator
            .ensure_registry()
            .map_err(|e| ProvisionError::Persistence(format!("{e:#}")))?;
        Ok(allocator)
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Allocate the lowest free port in range for `owner`.
    ///
    /// An owner that already holds a port in range gets the same port back, so a
    /// retried provisioning call does not leak ports.
    pub fn allocate(&self, owner: &str) -> ProvisionResult<u16> {
        let range = self.range;
        let allocated = self
            .atomic_update(|entries| {
                if let Some((port, _)) = entries
                    .iter()
                    .find(|(port, held_by)| range.contains(**port) && held_by.as_str() == owner)
                {
                    return Ok(Some(*port));
                }

                let free = range.iter().find(|port| !entries.contains_key(port));
                if let Some(port) = free {
                    entries.insert(port, owner.to_string());
                }
                Ok(free)
            })
            .map_err(|e| ProvisionError::Persistence(format!("{e:#}")))?;

        match allocated {
            Some(port) => {
                info!(port, owner, "Allocated port");
                Ok(port)
            }
            None => Err(ProvisionError::PortExhausted {
                range: range.to_string(),
            }),
        }
    }

    /// Return `port` to the pool. Releasing a port that is not held is a no-op;
    /// the return value says whether anything was released.
    pub fn release(&self, port: u16) -> ProvisionResult<bool> {
        let released = self
            .atomic_update(|entries| Ok(entries.remove(&port).is_some()))
            .map_err(|e| ProvisionError::Persistence(format!("{e:#}")))?;
        if released {
            info!(port, "Released port");
        } else {
            debug!(port, "Port was not held");
        }
        Ok(released)
    }

    /// The owner currently holding `port`, if any.
    pub fn holder(&self, port: u16) -> ProvisionResult<Option<String>> {
        Ok(self.allocated()?.remove(&port))
    }

    /// Snapshot of every held port.
    pub fn allocated(&self) -> ProvisionResult<BTreeMap<u16, String>> {
        self.atomic_update(|entries| Ok(entries.clone()))
            .map_err(|e| ProvisionError::Persistence(format!("{e:#}")))
    }

    fn ensure_registry(&self) -> Result<()> {
        if let Some(parent) = self.registry_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create registry directory: {:?}", parent)
                })?;
            }
        }
        if !self.registry_path.exists() {
            self.atomic_update(|_| Ok(()))?;
        }
        Ok(())
    }

    fn read_entries(&self) -> Result<Allocations> {
        let content = match fs::read_to_string(&self.registry_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Allocations::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read port registry: {:?}", self.registry_path)
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Allocations::new());
        }
        serde_json::from_str(&content).with_context(|| "Failed to parse port registry JSON")
    }

    /// Run `update_fn` against the registry under both locks and persist the result.
    fn atomic_update<T, F>(&self, update_fn: F) -> Result<T>
    where
        F: FnOnce(&mut Allocations) -> Result<T>,
    {
        let _in_process = self
            .guard
            .lock()
            .map_err(|_| anyhow::anyhow!("Port allocator mutex poisoned"))?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", self.lock_path))?;

        let lock_start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) => {
                    if lock_start.elapsed() > LOCK_TIMEOUT {
                        return Err(anyhow::anyhow!(
                            "Timeout waiting for exclusive lock on {:?}: {}",
                            self.lock_path,
                            e
                        ));
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
            }
        }

        let _unlock = scopeguard::guard((), |_| {
            let _ = lock_file.unlock();
        });

        let mut entries = self.read_entries()?;
        let before = entries.clone();
        let result = update_fn(&mut entries)?;

        if entries != before || !self.registry_path.exists() {
            let json_content = serde_json::to_string_pretty(&entries)
                .with_context(|| "Failed to serialize port registry")?;
            let temp_path = self
                .registry_path
                .with_extension(format!("json.tmp.{}", std::process::id()));
            fs::write(&temp_path, json_content)
                .with_context(|| format!("Failed to write temporary file: {:?}", temp_path))?;
            fs::rename(&temp_path, &self.registry_path)
                .with_context(|| "Failed to atomically rename port registry")?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn allocator(dir: &Path, start: u16, end: u16) -> PortAllocator {
        PortAllocator::open(
            dir.join("ports.json"),
            PortRange::new(start, end).expect("valid range"),
        )
        .expect("open allocator")
    }

    #[test]
    fn test_allocates_lowest_free_port() {
        let dir = tempdir().expect("tempdir");
        let ports = allocator(dir.path(), 8100, 8109);

        assert_eq!(ports.allocate("ws-a").unwrap(), 8100);
        assert_eq!(ports.allocate("ws-b").unwrap(), 8101);
        assert_eq!(ports.allocate("ws-c").unwrap(), 8102);

        assert!(ports.release(8101).unwrap());
        assert_eq!(ports.allocate("ws-d").unwrap(), 8101);
    }

    #[test]
    fn test_same_owner_gets_same_port() {
        let dir = tempdir().expect("tempdir");
        let ports = allocator(dir.path(), 8100, 8109);

        let first = ports.allocate("ws-a").unwrap();
        let again = ports.allocate("ws-a").unwrap();
        assert_eq!(first, again);
        assert_eq!(ports.allocated().unwrap().len(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let dir = tempdir().expect("tempdir");
        let ports = allocator(dir.path(), 8100, 8101);

        ports.allocate("ws-a").unwrap();
        ports.allocate("ws-b").unwrap();
        let err = ports.allocate("ws-c").unwrap_err();
        assert!(matches!(err, ProvisionError::PortExhausted { .. }));
        assert_eq!(err.to_string(), "No free port in range 8100-8101");
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let ports = allocator(dir.path(), 8100, 8109);

        let port = ports.allocate("ws-a").unwrap();
        assert!(ports.release(port).unwrap());
        assert!(!ports.release(port).unwrap());
        assert!(!ports.release(9999).unwrap());
        assert_eq!(ports.holder(port).unwrap(), None);
    }

    #[test]
    fn test_registry_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let ports = allocator(dir.path(), 8100, 8109);
            ports.allocate("ws-a").unwrap();
        }
        let ports = allocator(dir.path(), 8100, 8109);
        assert_eq!(ports.holder(8100).unwrap().as_deref(), Some("ws-a"));
        assert_eq!(ports.allocate("ws-b").unwrap(), 8101);
    }

    #[test]
    fn test_out_of_range_entries_are_ignored() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("ports.json"), r#"{"7000": "legacy"}"#).unwrap();
        let ports = allocator(dir.path(), 8100, 8109);

        assert_eq!(ports.allocate("legacy").unwrap(), 8100);
        assert_eq!(ports.allocated().unwrap().len(), 2);
    }
}
