//! Host-level resources owned by a workspace: the OS account, its disk quota and the
//! systemd units that supervise the editor and any template-defined services.

pub mod accounts;
pub mod supervisor;

pub use accounts::AccountManager;
pub use supervisor::{EditorService, ResourceLimits, ServiceState, ServiceSupervisor, ServiceUnit};
