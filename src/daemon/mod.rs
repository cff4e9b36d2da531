//! The build daemon: slot coordination, lifecycle, connections and cluster
//! participation.

pub mod connection;
pub mod environment;
pub mod invoker;
pub mod launch;
pub mod reconnect;
pub mod service;
pub mod slot_lock;

pub use connection::{
    CloseProtectedRemoteDaemonConnection, DefaultSocketFactory, RemoteDaemonConnection,
    SocketFactory,
};
pub use environment::{DaemonEnvironment, DaemonError, ProjectHandle};
pub use invoker::{ClusterInvokerFactory, InvokeError, TaskInvocationContext};
pub use launch::{LaunchError, StartOutcome, connect_or_spawn, start_daemon};
pub use reconnect::{BackoffConfig, ShutdownToken};
pub use service::{DaemonClientServer, DaemonConnectionService};
pub use slot_lock::{SlotLockError, running_daemon_ports};
