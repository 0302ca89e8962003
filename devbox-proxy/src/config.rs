//! Serde model of the proxy's file-provider dynamic configuration.
//!
//! Only the fields devbox writes are modeled. Routers and services that devbox does not
//! own are carried through untouched because both maps preserve insertion order and
//! unknown router/service bodies are kept as raw YAML values.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;

/// Prefix of every router and service name devbox manages.
pub const MANAGED_PREFIX: &str = "devbox-";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub http: HttpSection,

    #[serde(flatten)]
    pub other: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default)]
    pub routers: IndexMap<String, Value>,

    #[serde(default)]
    pub services: IndexMap<String, Value>,

    #[serde(flatten)]
    pub other: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub rule: String,
    pub service: String,
    #[serde(rename = "entryPoints")]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterTls {
    #[serde(rename = "certResolver", default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "loadBalancer")]
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

/// Router/service key for a hostname, e.g. `dev1-acme.ws.example.com` -> `devbox-dev1-acme-ws-example-com`.
pub fn route_key(hostname: &str) -> String {
    format!("{}{}", MANAGED_PREFIX, hostname.replace('.', "-"))
}

/// Loopback backend URL for a port.
pub fn backend_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

/// Extract the port from a loopback backend URL written by [`backend_url`].
pub fn backend_port(url: &str) -> Option<u16> {
    url.strip_prefix("http://127.0.0.1:")?.parse().ok()
}

/// Extract the hostname from a ``Host(`...`)`` rule.
pub fn rule_host(rule: &str) -> Option<&str> {
    rule.strip_prefix("Host(`")?.strip_suffix("`)")
}
