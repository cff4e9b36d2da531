//! Cluster invoker factory.
//!
//! One factory per connection answers the coordinator's request to create a
//! task invoker. The produced invocation brackets the run: signal the trace,
//! prepare the project, register the execution resolver on the connection,
//! run the tasks, then unregister and finish the project on every exit path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use thiserror::Error;
use uuid::Uuid;

use crate::build::project::ExecutionResolver;
use crate::build::{
    BuildTrace, ClusterSetup, ExecutionContext, ExecutionInvoker, PathKey, ProjectCache,
    ProjectError, TaskInvocationRequest, TaskInvocationResult, TaskInvokerInformation,
};
use crate::rpc::ResolverRegistry;

use super::environment::DaemonEnvironment;

/// Resolver id under which an execution's resolver is registered on the
/// connection while a cluster invocation runs. Deterministic so both sides
/// derive the same id from the working directory.
pub fn cluster_invoker_resolver_id(working_directory: &PathKey) -> String {
    format!(
        "execclasses:{}:{}",
        working_directory.provider(),
        working_directory.path().display()
    )
}

/// Per-working-directory mirror subdirectory under the configured base.
///
/// The digest only names the directory; collisions merely share a mirror
/// subdirectory between working directories.
pub fn mirror_directory_for_working_directory(base: &Path, key: &PathKey) -> PathBuf {
    let digest = crc32c::crc32c(format!("{}/{}", key.provider(), key.path().display()).as_bytes());
    base.join(format!("{digest:08x}"))
}

/// What the coordinator hands to [`ClusterTaskInvocation::run`].
pub struct TaskInvocationContext {
    pub trace: BuildTrace,
    pub requests: Vec<TaskInvocationRequest>,
}

pub struct ClusterInvokerFactory {
    daemon: Weak<DaemonEnvironment>,
    resolver_registry: Arc<ResolverRegistry>,
    cluster_mirror_directory: Option<PathBuf>,
    environment_identifier: Uuid,
}

impl ClusterInvokerFactory {
    pub(super) fn new(
        daemon: Weak<DaemonEnvironment>,
        resolver_registry: Arc<ResolverRegistry>,
        cluster_mirror_directory: Option<PathBuf>,
        environment_identifier: Uuid,
    ) -> Self {
        Self {
            daemon,
            resolver_registry,
            cluster_mirror_directory,
            environment_identifier,
        }
    }

    /// Lets coordinators recognize repeat workers.
    pub fn environment_identifier(&self) -> Uuid {
        self.environment_identifier
    }

    /// Bind an invocation to the project of the execution's working
    /// directory and its mirror subdirectory.
    pub fn create_task_invoker(
        &self,
        execution_context: ExecutionContext,
        invoker_information: TaskInvokerInformation,
    ) -> Result<ClusterTaskInvocation, InvokeError> {
        let Some(daemon) = self.daemon.upgrade() else {
            return Err(InvokeError::DaemonUnavailable);
        };
        let working_directory = execution_context.working_directory().clone();
        let project = daemon
            .get_project(working_directory.clone())
            .map_err(|err| InvokeError::Project {
                working_directory: working_directory.clone(),
                source: Box::new(err),
            })?
            .project()
            .clone();
        let mirror_directory = self
            .cluster_mirror_directory
            .as_deref()
            .map(|base| mirror_directory_for_working_directory(base, &working_directory));

        Ok(ClusterTaskInvocation {
            daemon,
            resolver_registry: Arc::clone(&self.resolver_registry),
            project,
            mirror_directory,
            execution_context,
            invoker_information,
        })
    }
}

/// One prepared cluster invocation, tied to its project and mirror
/// directory.
pub struct ClusterTaskInvocation {
    daemon: Arc<DaemonEnvironment>,
    resolver_registry: Arc<ResolverRegistry>,
    project: Arc<ProjectCache>,
    mirror_directory: Option<PathBuf>,
    execution_context: ExecutionContext,
    invoker_information: TaskInvokerInformation,
}

impl ClusterTaskInvocation {
    pub fn mirror_directory(&self) -> Option<&Path> {
        self.mirror_directory.as_deref()
    }

    pub fn run(
        &self,
        context: TaskInvocationContext,
    ) -> Result<Vec<TaskInvocationResult>, InvokeError> {
        let environment = self
            .daemon
            .build_environment()
            .map_err(|_| InvokeError::DaemonUnavailable)?;
        context
            .trace
            .start_build_cluster(environment.identifier(), self.mirror_directory.as_ref());

        let execution_key = Uuid::new_v4();
        let setup = ClusterSetup {
            path_configuration: self.execution_context.path_configuration.clone(),
            repository_configuration: self.execution_context.repository_configuration.clone(),
            script_configuration: self.execution_context.script_configuration.clone(),
            user_parameters: self.execution_context.user_parameters.clone(),
            mirror_directory: self.mirror_directory.clone(),
            coordinator_provider_key: self.invoker_information.coordinator_provider_key,
            database_configuration: self.invoker_information.database_configuration.clone(),
        };
        self.project
            .cluster_starting(&setup, execution_key)
            .map_err(InvokeError::ClusterStart)?;

        let resolver = self.project.execution_resolver();
        let resolver_id = cluster_invoker_resolver_id(self.project.working_directory());
        self.resolver_registry
            .register(resolver_id.clone(), Arc::clone(&resolver));

        // Unregistration and cluster_finished must run on every exit path.
        let _cleanup = InvocationCleanup {
            project: &self.project,
            registry: &self.resolver_registry,
            resolver_id,
            resolver,
            execution_key,
        };

        let invoker = ClusterTaskInvoker {
            execution: ExecutionInvoker::new(environment),
        };
        Ok(invoker.run(&context.trace, &context.requests))
    }
}

struct InvocationCleanup<'a> {
    project: &'a Arc<ProjectCache>,
    registry: &'a Arc<ResolverRegistry>,
    resolver_id: String,
    resolver: Arc<ExecutionResolver>,
    execution_key: Uuid,
}

impl Drop for InvocationCleanup<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.resolver_id, &self.resolver);
        self.project.cluster_finished(&self.execution_key);
    }
}

/// Executes the invocation requests against the local environment.
struct ClusterTaskInvoker {
    execution: ExecutionInvoker,
}

impl ClusterTaskInvoker {
    fn run(
        &self,
        trace: &BuildTrace,
        requests: &[TaskInvocationRequest],
    ) -> Vec<TaskInvocationResult> {
        requests
            .iter()
            .map(|request| {
                trace.task_invoked(&request.task_id);
                self.execution.invoke(request)
            })
            .collect()
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InvokeError {
    #[error("failed to start cluster execution: {0}")]
    ClusterStart(#[source] ProjectError),

    #[error("failed to obtain project for {working_directory}: {source}")]
    Project {
        working_directory: PathKey,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("daemon environment is no longer available")]
    DaemonUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_id_is_deterministic() {
        let provider = Uuid::new_v4();
        let key = PathKey::new(provider, "/work/project");
        assert_eq!(
            cluster_invoker_resolver_id(&key),
            format!("execclasses:{provider}:/work/project")
        );
    }

    #[test]
    fn mirror_directory_is_stable_per_working_directory() {
        let base = Path::new("/mirror");
        let key = PathKey::new(Uuid::new_v4(), "/work/project");
        let first = mirror_directory_for_working_directory(base, &key);
        let second = mirror_directory_for_working_directory(base, &key);
        assert_eq!(first, second);
        assert_eq!(first.parent(), Some(base));

        let other = PathKey::new(Uuid::new_v4(), "/work/other");
        assert_ne!(first, mirror_directory_for_working_directory(base, &other));
    }
}
