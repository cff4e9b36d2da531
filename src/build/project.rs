//! Per-working-directory project cache.
//!
//! A project keeps the state a worker needs across cluster invocations for
//! one working directory: the execution resolver registered on connections,
//! the mirror handler, and the set of in-flight cluster executions. Projects
//! are shared: overlapping `cluster_starting` / `cluster_finished` brackets
//! with distinct execution keys must be tolerated.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;

use super::context::{
    DatabaseConfiguration, PathConfiguration, PathKey, RepositoryConfiguration,
    ScriptConfiguration,
};

/// Everything `cluster_starting` needs to prepare the project for one
/// execution.
#[derive(Debug, Clone)]
pub struct ClusterSetup {
    pub path_configuration: PathConfiguration,
    pub repository_configuration: RepositoryConfiguration,
    pub script_configuration: ScriptConfiguration,
    pub user_parameters: BTreeMap<String, String>,
    pub mirror_directory: Option<PathBuf>,
    pub coordinator_provider_key: Uuid,
    pub database_configuration: DatabaseConfiguration,
}

/// Stages files proxied from the coordinator under a local scratch base.
#[derive(Debug, Clone)]
pub struct MirrorHandler {
    base: PathBuf,
}

impl MirrorHandler {
    fn create(base: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(base)?;
        Ok(Self {
            base: base.to_path_buf(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.base
    }
}

/// Resolves execution-defined identifiers for one project; registered on the
/// connection resolver registry while a cluster invocation runs.
#[derive(Debug)]
pub struct ExecutionResolver {
    working_directory: PathKey,
}

impl ExecutionResolver {
    pub fn working_directory(&self) -> &PathKey {
        &self.working_directory
    }
}

struct ActiveExecution {
    coordinator_provider_key: Uuid,
}

struct ProjectState {
    closed: bool,
    active: HashMap<Uuid, ActiveExecution>,
    mirror: Option<MirrorHandler>,
    loaded_repositories: BTreeMap<String, String>,
}

pub struct ProjectCache {
    working_directory: PathKey,
    execution_resolver: Arc<ExecutionResolver>,
    state: Mutex<ProjectState>,
}

impl ProjectCache {
    pub fn new(working_directory: PathKey) -> Self {
        let execution_resolver = Arc::new(ExecutionResolver {
            working_directory: working_directory.clone(),
        });
        Self {
            working_directory,
            execution_resolver,
            state: Mutex::new(ProjectState {
                closed: false,
                active: HashMap::new(),
                mirror: None,
                loaded_repositories: BTreeMap::new(),
            }),
        }
    }

    pub fn working_directory(&self) -> &PathKey {
        &self.working_directory
    }

    pub fn execution_resolver(&self) -> Arc<ExecutionResolver> {
        Arc::clone(&self.execution_resolver)
    }

    /// Prepare the project for a cluster execution identified by
    /// `execution_key`. Creates the mirror directory when one is configured.
    pub fn cluster_starting(
        &self,
        setup: &ClusterSetup,
        execution_key: Uuid,
    ) -> Result<(), ProjectError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ProjectError::Closed {
                working_directory: self.working_directory.clone(),
            });
        }
        if state.active.contains_key(&execution_key) {
            return Err(ProjectError::DuplicateExecution { execution_key });
        }
        if let Some(mirror_dir) = &setup.mirror_directory
            && state.mirror.is_none()
        {
            state.mirror = Some(MirrorHandler::create(mirror_dir)?);
        }
        state
            .loaded_repositories
            .extend(setup.repository_configuration.repositories.clone());
        state.active.insert(
            execution_key,
            ActiveExecution {
                coordinator_provider_key: setup.coordinator_provider_key,
            },
        );
        Ok(())
    }

    /// Tear down the execution bracket. Must run on every exit path of a
    /// cluster invocation; finishing an unknown key is a no-op.
    pub fn cluster_finished(&self, execution_key: &Uuid) {
        self.lock().active.remove(execution_key);
    }

    pub fn active_execution_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn coordinator_of(&self, execution_key: &Uuid) -> Option<Uuid> {
        self.lock()
            .active
            .get(execution_key)
            .map(|execution| execution.coordinator_provider_key)
    }

    pub fn mirror_handler(&self) -> Option<MirrorHandler> {
        self.lock().mirror.clone()
    }

    pub fn loaded_repositories(&self) -> BTreeMap<String, String> {
        self.lock().loaded_repositories.clone()
    }

    /// Drop cached per-execution state, keeping the project usable.
    pub fn clean(&self) {
        let mut state = self.lock();
        state.loaded_repositories.clear();
        state.mirror = None;
    }

    /// Clean plus forgetting in-flight executions.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.loaded_repositories.clear();
        state.mirror = None;
        state.active.clear();
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.active.clear();
        state.mirror = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, ProjectState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProjectError {
    #[error("project for {working_directory} is closed")]
    Closed { working_directory: PathKey },

    #[error("execution {execution_key} is already active on this project")]
    DuplicateExecution { execution_key: Uuid },

    #[error("mirror directory error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_setup(mirror: Option<PathBuf>) -> ClusterSetup {
        let key = PathKey::new(Uuid::new_v4(), "/work/project");
        ClusterSetup {
            path_configuration: PathConfiguration {
                working_directory: key,
            },
            repository_configuration: RepositoryConfiguration::default(),
            script_configuration: ScriptConfiguration::default(),
            user_parameters: BTreeMap::new(),
            mirror_directory: mirror,
            coordinator_provider_key: Uuid::new_v4(),
            database_configuration: DatabaseConfiguration::default(),
        }
    }

    #[test]
    fn overlapping_executions_with_distinct_keys_are_tolerated() {
        let project = ProjectCache::new(PathKey::new(Uuid::new_v4(), "/work/project"));
        let setup = test_setup(None);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        project.cluster_starting(&setup, first).unwrap();
        project.cluster_starting(&setup, second).unwrap();
        assert_eq!(project.active_execution_count(), 2);
        project.cluster_finished(&first);
        assert_eq!(project.active_execution_count(), 1);
        project.cluster_finished(&second);
        assert_eq!(project.active_execution_count(), 0);
    }

    #[test]
    fn duplicate_execution_key_is_rejected() {
        let project = ProjectCache::new(PathKey::new(Uuid::new_v4(), "/work/project"));
        let setup = test_setup(None);
        let key = Uuid::new_v4();
        project.cluster_starting(&setup, key).unwrap();
        assert!(matches!(
            project.cluster_starting(&setup, key),
            Err(ProjectError::DuplicateExecution { .. })
        ));
    }

    #[test]
    fn cluster_starting_fails_on_closed_project() {
        let project = ProjectCache::new(PathKey::new(Uuid::new_v4(), "/work/project"));
        project.close();
        assert!(project.is_closed());
        assert!(matches!(
            project.cluster_starting(&test_setup(None), Uuid::new_v4()),
            Err(ProjectError::Closed { .. })
        ));
    }

    #[test]
    fn mirror_directory_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror").join("af13");
        let project = ProjectCache::new(PathKey::new(Uuid::new_v4(), "/work/project"));
        project
            .cluster_starting(&test_setup(Some(mirror.clone())), Uuid::new_v4())
            .unwrap();
        assert!(mirror.is_dir());
        assert_eq!(
            project.mirror_handler().unwrap().directory(),
            mirror.as_path()
        );
    }
}
