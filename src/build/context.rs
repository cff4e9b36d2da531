//! Execution context types exchanged between coordinators and workers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a directory: the file-provider UUID plus the path on it.
///
/// Two daemons exchanging paths qualify them with the provider so a path on
/// the coordinator's filesystem is never confused with a local one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathKey {
    provider: Uuid,
    path: PathBuf,
}

impl PathKey {
    pub fn new(provider: Uuid, path: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            path: path.into(),
        }
    }

    pub fn provider(&self) -> Uuid {
        self.provider
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.path.display())
    }
}

/// Path layout of a build execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfiguration {
    pub working_directory: PathKey,
}

/// Repositories loaded for an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfiguration {
    /// Repository identifier → location descriptor.
    pub repositories: BTreeMap<String, String>,
}

/// Script language configuration of an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfiguration {
    /// Script wildcard pattern → provider name.
    pub providers: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
}

/// Content database configuration of an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfiguration {
    /// Wildcard pattern → content descriptor association.
    pub associations: BTreeMap<String, String>,
}

/// Snapshot of a remote execution, shipped by the coordinator when it asks a
/// worker to create a task invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub path_configuration: PathConfiguration,
    #[serde(default)]
    pub repository_configuration: RepositoryConfiguration,
    #[serde(default)]
    pub script_configuration: ScriptConfiguration,
    #[serde(default)]
    pub database_configuration: DatabaseConfiguration,
    #[serde(default)]
    pub user_parameters: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn working_directory(&self) -> &PathKey {
        &self.path_configuration.working_directory
    }
}

/// Coordinator-side facts a worker needs before invoking tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInvokerInformation {
    pub coordinator_provider_key: Uuid,
    #[serde(default)]
    pub database_configuration: DatabaseConfiguration,
}

/// One task the coordinator wants invoked on this worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInvocationRequest {
    pub task_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInvocationResult {
    pub task_id: String,
    pub invoked_by: Uuid,
}

/// Event recorder for one execution; the worker signals cluster lifecycle
/// transitions into it.
#[derive(Clone, Default)]
pub struct BuildTrace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    ClusterStarting {
        environment: Uuid,
        mirror_directory: Option<PathBuf>,
    },
    TaskInvoked {
        task_id: String,
    },
}

impl BuildTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_build_cluster(&self, environment: Uuid, mirror_directory: Option<&PathBuf>) {
        self.record(TraceEvent::ClusterStarting {
            environment,
            mirror_directory: mirror_directory.cloned(),
        });
    }

    pub fn task_invoked(&self, task_id: &str) {
        self.record(TraceEvent::TaskInvoked {
            task_id: task_id.to_string(),
        });
    }

    fn record(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}
