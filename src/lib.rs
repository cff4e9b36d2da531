#![deny(unsafe_code)]

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
mod paths;
pub mod rpc;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at the crate root.
pub use crate::build::{BuildEnvironment, EnvironmentParameters, PathKey};
pub use crate::config::{DEFAULT_PORT, DaemonLaunchParameters};
pub use crate::daemon::{DaemonEnvironment, RemoteDaemonConnection, running_daemon_ports};
