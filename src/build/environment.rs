//! The shared build environment hosted by a daemon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use super::context::{TaskInvocationRequest, TaskInvocationResult};

/// Parameters the environment is constructed from.
#[derive(Debug, Clone)]
pub struct EnvironmentParameters {
    pub storage_directory: PathBuf,
    pub thread_factor: u32,
    pub user_parameters: BTreeMap<String, String>,
}

/// The build environment handle.
///
/// Owns a UUID identifier stable for its lifetime; shared by every inbound
/// connection and every cluster invocation of the hosting daemon.
pub struct BuildEnvironment {
    identifier: Uuid,
    storage_directory: PathBuf,
    thread_factor: u32,
    user_parameters: BTreeMap<String, String>,
    closed: AtomicBool,
}

impl BuildEnvironment {
    pub fn new(params: EnvironmentParameters) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&params.storage_directory)?;
        let thread_factor = if params.thread_factor == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        } else {
            params.thread_factor
        };
        Ok(Arc::new(Self {
            identifier: Uuid::new_v4(),
            storage_directory: params.storage_directory,
            thread_factor,
            user_parameters: params.user_parameters,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn identifier(&self) -> Uuid {
        self.identifier
    }

    pub fn storage_directory(&self) -> &Path {
        &self.storage_directory
    }

    /// Resolved thread factor; never zero.
    pub fn thread_factor(&self) -> u32 {
        self.thread_factor
    }

    pub fn user_parameters(&self) -> &BTreeMap<String, String> {
        &self.user_parameters
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Executes task invocation requests against a build environment.
#[derive(Clone)]
pub struct ExecutionInvoker {
    environment: Arc<BuildEnvironment>,
}

impl ExecutionInvoker {
    pub fn new(environment: Arc<BuildEnvironment>) -> Self {
        Self { environment }
    }

    pub fn environment_identifier(&self) -> Uuid {
        self.environment.identifier()
    }

    pub fn invoke(&self, request: &TaskInvocationRequest) -> TaskInvocationResult {
        tracing::debug!(task = %request.task_id, "invoking task");
        TaskInvocationResult {
            task_id: request.task_id.clone(),
            invoked_by: self.environment.identifier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_factor_zero_resolves_to_parallelism() {
        let dir = tempfile::tempdir().unwrap();
        let env = BuildEnvironment::new(EnvironmentParameters {
            storage_directory: dir.path().to_path_buf(),
            thread_factor: 0,
            user_parameters: BTreeMap::new(),
        })
        .unwrap();
        assert!(env.thread_factor() >= 1);
    }

    #[test]
    fn identifier_is_stable_for_the_environment_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let env = BuildEnvironment::new(EnvironmentParameters {
            storage_directory: dir.path().to_path_buf(),
            thread_factor: 2,
            user_parameters: BTreeMap::new(),
        })
        .unwrap();
        assert_eq!(env.identifier(), env.identifier());
        let invoker = ExecutionInvoker::new(Arc::clone(&env));
        assert_eq!(invoker.environment_identifier(), env.identifier());
    }
}
