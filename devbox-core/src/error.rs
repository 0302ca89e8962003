use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::system::SystemError;

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors surfaced by provisioning and lifecycle operations.
///
/// Low-level failures are wrapped with the username, port, hostname or action id
/// they concern. Only the provisioner decides whether a variant is fatal.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("No free port in range {range}")]
    PortExhausted { range: String },

    #[error("Failed to create account '{username}': {reason}")]
    AccountCreation { username: String, reason: String },

    #[error("Failed to install editor service for '{username}' on port {port}: {reason}")]
    ServiceInstall {
        username: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to register route {hostname} -> 127.0.0.1:{port}: {reason}")]
    RouteRegistration {
        hostname: String,
        port: u16,
        reason: String,
    },

    #[error("Action '{action_id}' has invalid parameters: {reason}")]
    ActionValidation { action_id: String, reason: String },

    #[error("Action '{action_id}' failed after {attempts} attempt(s): {reason}")]
    ActionExecution {
        action_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Disk quota for '{username}' not applied: {reason}")]
    QuotaApplication { username: String, reason: String },

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Service control failed: {0}")]
    Service(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    System(#[from] SystemError),
}

/// Coarse classification of a [`ProvisionError`], reported in outbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PortExhausted,
    AccountCreation,
    ServiceInstall,
    RouteRegistration,
    ActionValidation,
    ActionExecution,
    QuotaApplication,
    TemplateNotFound,
    NotFound,
    InvalidInput,
    InvalidState,
    Service,
    Internal,
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::PortExhausted { .. } => ErrorKind::PortExhausted,
            ProvisionError::AccountCreation { .. } => ErrorKind::AccountCreation,
            ProvisionError::ServiceInstall { .. } => ErrorKind::ServiceInstall,
            ProvisionError::RouteRegistration { .. } => ErrorKind::RouteRegistration,
            ProvisionError::ActionValidation { .. } => ErrorKind::ActionValidation,
            ProvisionError::ActionExecution { .. } => ErrorKind::ActionExecution,
            ProvisionError::QuotaApplication { .. } => ErrorKind::QuotaApplication,
            ProvisionError::TemplateNotFound(_) => ErrorKind::TemplateNotFound,
            ProvisionError::NotFound(_) => ErrorKind::NotFound,
            ProvisionError::InvalidInput(_) => ErrorKind::InvalidInput,
            ProvisionError::InvalidState(_) => ErrorKind::InvalidState,
            ProvisionError::Service(_) => ErrorKind::Service,
            ProvisionError::Persistence(_)
            | ProvisionError::Serialization(_)
            | ProvisionError::Io(_)
            | ProvisionError::System(_) => ErrorKind::Internal,
        }
    }

    /// First line of the message, capped for storage on the workspace record.
    pub fn short_reason(&self) -> String {
        const MAX_REASON: usize = 200;
        let message = self.to_string();
        let first_line = message.lines().next().unwrap_or_default();
        if first_line.chars().count() <= MAX_REASON {
            first_line.to_string()
        } else {
            let truncated: String = first_line.chars().take(MAX_REASON).collect();
            format!("{truncated}...")
        }
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(err: serde_json::Error) -> Self {
        ProvisionError::Serialization(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for ProvisionError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        ProvisionError::Serialization(err.to_string())
    }
}
