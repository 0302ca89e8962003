//! Network port management for devbox workspaces.
//!
//! Each workspace's editor listens on a loopback port taken from a fixed range. The
//! allocator guarantees that no two workspaces hold the same port, across threads and
//! across processes sharing the registry file.

pub mod allocator;
pub mod range;

pub use allocator::PortAllocator;
pub use range::PortRange;
