//! Build-engine facade: the environment handle, per-project caches and the
//! execution context types exchanged with cluster coordinators.

pub mod context;
pub mod environment;
pub mod project;

pub use context::{
    BuildTrace, DatabaseConfiguration, ExecutionContext, PathConfiguration, PathKey,
    RepositoryConfiguration, ScriptConfiguration, TaskInvocationRequest, TaskInvocationResult,
    TaskInvokerInformation, TraceEvent,
};
pub use environment::{BuildEnvironment, EnvironmentParameters, ExecutionInvoker};
pub use project::{ClusterSetup, MirrorHandler, ProjectCache, ProjectError};
