use devbox_core::SystemError;
use thiserror::Error;

/// Failure of a single handler call.
///
/// The executor attaches the action id and attempt count when it converts this into a
/// `ProvisionError`.
#[derive(Error, Debug)]
pub enum ActionError {
    /// Parameters are unusable; retrying cannot help.
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Failed(String),

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl ActionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ActionError::Invalid(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ActionError::Invalid(_))
    }
}

impl From<SystemError> for ActionError {
    fn from(err: SystemError) -> Self {
        match err {
            SystemError::Timeout { secs, .. } => ActionError::Timeout { secs },
            other => ActionError::Failed(other.to_string()),
        }
    }
}

impl From<devbox_core::ProvisionError> for ActionError {
    fn from(err: devbox_core::ProvisionError) -> Self {
        match err {
            devbox_core::ProvisionError::InvalidInput(message) => ActionError::Invalid(message),
            devbox_core::ProvisionError::System(SystemError::Timeout { secs, .. }) => {
                ActionError::Timeout { secs }
            }
            other => ActionError::Failed(other.to_string()),
        }
    }
}
