// Standard library
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// External crates
use anyhow::{Context, Result};
use devbox_core::validation::validate_hostname;
use devbox_core::{ProvisionError, Result as ProvisionResult};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

// Internal imports
use crate::config::{
    backend_port, backend_url, route_key, rule_host, DynamicConfig, LoadBalancer, Router,
    RouterTls, Server, Service, MANAGED_PREFIX,
};

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// How routers are exposed by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSettings {
    /// Entry point that terminates TLS, e.g. `websecure`.
    pub entry_point: String,
    /// ACME resolver used for certificates; `None` uses the proxy's default store.
    pub cert_resolver: Option<String>,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            entry_point: "websecure".to_string(),
            cert_resolver: Some("letsencrypt".to_string()),
        }
    }
}

/// Maintains hostname -> loopback port routes in the proxy's watched config file.
///
/// The file is shared by every workspace, so each change is a read-modify-write under
/// an in-process mutex and an exclusive lock on `<file>.lock`, published with an atomic
/// rename so the watching proxy never reads a partial file.
#[derive(Debug)]
pub struct RouteManager {
    config_path: PathBuf,
    lock_path: PathBuf,
    settings: RouteSettings,
    guard: Mutex<()>,
}

impl RouteManager {
    pub fn new(config_path: impl Into<PathBuf>, settings: RouteSettings) -> Self {
        let config_path = config_path.into();
        let mut lock_name = config_path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            config_path,
            lock_path: PathBuf::from(lock_name),
            settings,
            guard: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn public_url(hostname: &str) -> String {
        format!("https://{}", hostname)
    }

    /// Register `hostname` -> `127.0.0.1:port` and return the external URL.
    #[instrument(skip(self))]
    pub fn add_route(&self, hostname: &str, port: u16) -> ProvisionResult<String> {
        validate_hostname(hostname).map_err(|e| route_error(hostname, port, e))?;

        let router = self.router_for(hostname);
        let service = Service {
            load_balancer: LoadBalancer {
                servers: vec![Server {
                    url: backend_url(port),
                }],
            },
        };

        let changed = self
            .atomic_update(|config| {
                let key = route_key(hostname);
                let router = serde_yaml_ng::to_value(&router)?;
                let service = serde_yaml_ng::to_value(&service)?;
                let unchanged = config.http.routers.get(&key) == Some(&router)
                    && config.http.services.get(&key) == Some(&service);
                config.http.routers.insert(key.clone(), router);
                config.http.services.insert(key, service);
                Ok(!unchanged)
            })
            .map_err(|e| route_error(hostname, port, e))?;

        if changed {
            info!(hostname, port, "Registered route");
        } else {
            debug!(hostname, port, "Route already registered");
        }
        Ok(Self::public_url(hostname))
    }

    /// Point an existing route at `new_port`.
    ///
    /// Router and service are replaced in a single write, so the hostname is never
    /// unrouted. A missing route is created.
    #[instrument(skip(self))]
    pub fn update_route(&self, hostname: &str, new_port: u16) -> ProvisionResult<String> {
        self.add_route(hostname, new_port)
    }

    /// Remove the route for `hostname`. Removing an absent route succeeds and returns `false`.
    #[instrument(skip(self))]
    pub fn remove_route(&self, hostname: &str) -> ProvisionResult<bool> {
        let removed = self
            .atomic_update(|config| {
                let key = route_key(hostname);
                let router = config.http.routers.shift_remove(&key).is_some();
                let service = config.http.services.shift_remove(&key).is_some();
                Ok(router || service)
            })
            .map_err(|e| ProvisionError::RouteRegistration {
                hostname: hostname.to_string(),
                port: 0,
                reason: format!("{e:#}"),
            })?;

        if removed {
            info!(hostname, "Removed route");
        }
        Ok(removed)
    }

    /// The port `hostname` currently forwards to.
    pub fn route_for(&self, hostname: &str) -> ProvisionResult<Option<u16>> {
        Ok(self.routes()?.get(hostname).copied())
    }

    /// Every devbox-managed route, keyed by hostname.
    pub fn routes(&self) -> ProvisionResult<BTreeMap<String, u16>> {
        let config = self
            .atomic_update(|config| Ok(config.clone()))
            .map_err(|e| ProvisionError::Persistence(format!("{e:#}")))?;

        let mut routes = BTreeMap::new();
        for (key, router) in &config.http.routers {
            if !key.starts_with(MANAGED_PREFIX) {
                continue;
            }
            let Ok(router) = serde_yaml_ng::from_value::<Router>(router.clone()) else {
                continue;
            };
            let Some(hostname) = rule_host(&router.rule) else {
                continue;
            };
            let port = config
                .http
                .services
                .get(&router.service)
                .cloned()
                .and_then(|s| serde_yaml_ng::from_value::<Service>(s).ok())
                .and_then(|s| s.load_balancer.servers.first().and_then(|srv| backend_port(&srv.url)));
            if let Some(port) = port {
                routes.insert(hostname.to_string(), port);
            }
        }
        Ok(routes)
    }

    fn router_for(&self, hostname: &str) -> Router {
        Router {
            rule: format!("Host(`{}`)", hostname),
            service: route_key(hostname),
            entry_points: vec![self.settings.entry_point.clone()],
            tls: Some(RouterTls {
                cert_resolver: self.settings.cert_resolver.clone(),
            }),
        }
    }

    fn read_config(&self) -> Result<DynamicConfig> {
        let content = match fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DynamicConfig::default())
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read route config: {:?}", self.config_path))
            }
        };
        if content.trim().is_empty() {
            return Ok(DynamicConfig::default());
        }
        serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse route config: {:?}", self.config_path))
    }

    /// Apply `update_fn` under both locks; the file is rewritten only when it reports a change.
    fn atomic_update<T, F>(&self, update_fn: F) -> Result<T>
    where
        F: FnOnce(&mut DynamicConfig) -> Result<T>,
        T: RouteChange,
    {
        let _in_process = self
            .guard
            .lock()
            .map_err(|_| anyhow::anyhow!("Route manager mutex poisoned"))?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create route directory: {:?}", parent))?;
            }
        }

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

        let mut config = self.read_config()?;
        let result = update_fn(&mut config)?;
        if result.changed() {
            self.write_config(&config)?;
        }
        Ok(result)
    }

    fn write_config(&self, config: &DynamicConfig) -> Result<()> {
        let yaml = serde_yaml_ng::to_string(config).with_context(|| "Failed to serialize route config")?;
        let mut temp_name = self.config_path.as_os_str().to_owned();
        temp_name.push(format!(".tmp.{}", std::process::id()));
        let temp_path = PathBuf::from(temp_name);

        fs::write(&temp_path, yaml)
            .with_context(|| format!("Failed to write temporary file: {:?}", temp_path))?;
        fs::rename(&temp_path, &self.config_path)
            .with_context(|| "Failed to atomically rename route config")?;
        Ok(())
    }
}

/// Whether the result of an update requires the file to be rewritten.
trait RouteChange {
    fn changed(&self) -> bool;
}

impl RouteChange for bool {
    fn changed(&self) -> bool {
        *self
    }
}

impl RouteChange for DynamicConfig {
    fn changed(&self) -> bool {
        false
    }
}

fn route_error(hostname: &str, port: u16, err: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::RouteRegistration {
        hostname: hostname.to_string(),
        port,
        reason: format!("{err:#}"),
    }
}
