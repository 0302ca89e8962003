//! Reverse-proxy route management.
//!
//! Workspaces are published by adding a router and a loopback service to the proxy's
//! file-provider dynamic configuration. TLS termination and certificate issuance are
//! the proxy's job; this crate only keeps the shared file consistent.

pub mod config;
pub mod routes;

pub use routes::{RouteManager, RouteSettings};
