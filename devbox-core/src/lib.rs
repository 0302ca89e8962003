//! Foundation types shared by every devbox crate.
//!
//! This crate owns the error taxonomy surfaced to callers, the [`system::System`]
//! capability through which all privileged OS interaction flows, credential
//! generation and input validation for account and host names.

pub mod error;
pub mod secrets;
pub mod system;
pub mod validation;

#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

pub use error::{ErrorKind, ProvisionError, Result};
pub use system::{CommandOutput, CommandSpec, HostSystem, System, SystemError};
