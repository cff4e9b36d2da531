//! The local daemon environment.
//!
//! Lifecycle: `UNSTARTED → STARTED → CLOSED`, monotonic. `start()` and
//! `close()` serialize on the lifecycle mutex and are the only writers of
//! the state; everything else reads it with acquire ordering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::build::{BuildEnvironment, EnvironmentParameters, ExecutionInvoker, PathKey};
use crate::build::project::ProjectCache;
use crate::cache::{CacheError, CacheKey, ResourceCache};
use crate::config::{ConfigError, DaemonLaunchParameters, StorageConfig};
use crate::rpc::server::{ConnectionSetup, RpcServer, ServerConfig};
use crate::rpc::ClientInvokerDescriptor;

use super::connection::{
    CloseProtectedRemoteDaemonConnection, DefaultSocketFactory, RemoteConnectionCacheKey,
    SocketFactory,
};
use super::reconnect::{BackoffConfig, ReconnectPool};
use super::service::DaemonConnectionService;
use super::slot_lock::{DaemonInstanceSlot, SlotLockError, SlotLockFile};

/// Linger of cached project caches.
pub const PROJECT_EXPIRY: Duration = Duration::from_secs(15 * 60);

const STATE_UNSTARTED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

struct RuntimeState {
    environment: Arc<BuildEnvironment>,
    execution_invoker: ExecutionInvoker,
    parameters: DaemonLaunchParameters,
    server: Option<RpcServer>,
    setup: Arc<dyn ConnectionSetup>,
}

struct SlotState {
    _slot: DaemonInstanceSlot,
    _lock_file: SlotLockFile,
}

/// A client-side cluster invoker registered on this daemon; the
/// registration lives exactly as long as its connection.
#[derive(Debug, Clone)]
struct ClientInvokerRegistration {
    environment_identifier: Uuid,
    connection_id: u64,
}

pub struct DaemonEnvironment {
    construct_parameters: DaemonLaunchParameters,
    socket_factory: Mutex<Arc<dyn SocketFactory>>,
    backoff: Mutex<BackoffConfig>,
    state: AtomicU8,
    lifecycle: Mutex<()>,
    runtime: Mutex<Option<RuntimeState>>,
    slot: Mutex<Option<SlotState>>,
    connection_cache: ResourceCache<RemoteConnectionCacheKey>,
    project_cache: ResourceCache<ProjectCacheKey>,
    client_invokers: Mutex<HashMap<u64, ClientInvokerRegistration>>,
    next_registration_id: AtomicU64,
    cluster_addresses: Mutex<Vec<SocketAddr>>,
    reconnect: Mutex<Option<ReconnectPool>>,
}

impl DaemonEnvironment {
    pub fn new(parameters: DaemonLaunchParameters) -> Arc<Self> {
        Arc::new(Self {
            construct_parameters: parameters,
            socket_factory: Mutex::new(Arc::new(DefaultSocketFactory)),
            backoff: Mutex::new(BackoffConfig::default()),
            state: AtomicU8::new(STATE_UNSTARTED),
            lifecycle: Mutex::new(()),
            runtime: Mutex::new(None),
            slot: Mutex::new(None),
            connection_cache: ResourceCache::new(),
            project_cache: ResourceCache::new(),
            client_invokers: Mutex::new(HashMap::new()),
            next_registration_id: AtomicU64::new(1),
            cluster_addresses: Mutex::new(Vec::new()),
            reconnect: Mutex::new(None),
        })
    }

    /// Replace the socket factory used for outbound connections.
    pub fn set_socket_factory(&self, factory: Arc<dyn SocketFactory>) -> Result<(), DaemonError> {
        self.check_unstarted()?;
        *lock(&self.socket_factory) = factory;
        Ok(())
    }

    /// Coordinator addresses this daemon dials to offer its capacity.
    pub fn set_connect_to_as_cluster_addresses(
        &self,
        addresses: Vec<SocketAddr>,
    ) -> Result<(), DaemonError> {
        self.check_unstarted()?;
        if !self.construct_parameters.acts_as_cluster {
            return Err(DaemonError::Config(
                ConfigError::ClusterAddressesWithoutCluster,
            ));
        }
        *lock(&self.cluster_addresses) = addresses;
        Ok(())
    }

    /// Tune the reconnect backoff. Primarily for tests; defaults match the
    /// production loop.
    pub fn set_reconnect_backoff(&self, backoff: BackoffConfig) -> Result<(), DaemonError> {
        self.check_unstarted()?;
        *lock(&self.backoff) = backoff;
        Ok(())
    }

    /// Start the daemon.
    ///
    /// With a configured port: acquire a slot in the lock file, and inside
    /// the slot's data lock construct the build environment, bind the
    /// server, publish the actual port and finalize the runtime parameters;
    /// the server begins accepting only after the state is STARTED. Without
    /// a port: no lock file, no server.
    pub fn start(self: &Arc<Self>) -> Result<(), DaemonError> {
        let _lifecycle = lock(&self.lifecycle);
        self.check_unstarted()?;
        self.construct_parameters.validate()?;

        let storage_directory = crate::paths::resolve_storage_directory(
            &self
                .construct_parameters
                .storage_directory
                .clone()
                .unwrap_or_else(crate::paths::default_storage_directory),
        );
        std::fs::create_dir_all(&storage_directory).map_err(SlotLockError::Io)?;

        let mut effective = self.construct_parameters.clone();
        match StorageConfig::load(&storage_directory) {
            Ok(Some(file)) => file.apply_defaults(&mut effective),
            Ok(None) => {}
            Err(err) => return Err(DaemonError::Config(err)),
        }

        let environment_parameters = EnvironmentParameters {
            storage_directory: storage_directory.clone(),
            thread_factor: effective.thread_factor,
            user_parameters: effective.user_parameters.clone(),
        };
        let cluster_mirror_directory = effective
            .cluster_mirror_directory
            .as_deref()
            .map(crate::paths::resolve_storage_directory);
        let mut runtime_parameters = effective.clone();
        runtime_parameters.storage_directory = Some(storage_directory.clone());
        runtime_parameters.cluster_mirror_directory = cluster_mirror_directory.clone();
        runtime_parameters.port = None;

        if let Some(port) = self.construct_parameters.effective_port() {
            let lock_file = SlotLockFile::open(&storage_directory)?;
            let mut slot = lock_file.acquire_slot()?;
            tracing::debug!(slot = slot.index(), "acquired daemon slot");

            // Everything below runs while the slot's data lock is held, so
            // enumerators never observe a half-initialized daemon.
            let built = self.build_server_runtime(
                environment_parameters,
                runtime_parameters,
                cluster_mirror_directory,
                port,
                effective.acts_as_server,
                effective.acts_as_cluster,
                &mut slot,
            );
            let runtime_state = match built {
                Ok(state) => state,
                Err(err) => {
                    // Release the slot before propagating so other processes
                    // immediately observe it as free.
                    drop(slot);
                    drop(lock_file);
                    return Err(err);
                }
            };
            let port = runtime_state.server.as_ref().map(RpcServer::port);
            *lock(&self.runtime) = Some(runtime_state);
            self.state.store(STATE_STARTED, Ordering::Release);

            // Accept only now that a fully initialized daemon is visible.
            let accept_result = {
                let runtime = lock(&self.runtime);
                match runtime.as_ref().and_then(|state| state.server.as_ref()) {
                    Some(server) => server.start(),
                    None => Ok(()),
                }
            };
            if let Err(err) = accept_result {
                self.rollback_failed_start();
                drop(slot);
                drop(lock_file);
                return Err(DaemonError::Startup {
                    source: Box::new(err),
                });
            }

            slot.finish_initialization();
            *lock(&self.slot) = Some(SlotState {
                _slot: slot,
                _lock_file: lock_file,
            });
            tracing::info!(port = port.unwrap_or(0), "daemon started");
        } else {
            let environment = BuildEnvironment::new(environment_parameters)
                .map_err(|err| DaemonError::Startup {
                    source: Box::new(err),
                })?;
            runtime_parameters.thread_factor = environment.thread_factor();
            let setup: Arc<dyn ConnectionSetup> = Arc::new(DaemonConnectionService::new(
                Arc::downgrade(self),
                effective.acts_as_cluster,
                cluster_mirror_directory.clone(),
            ));
            let execution_invoker = ExecutionInvoker::new(Arc::clone(&environment));
            *lock(&self.runtime) = Some(RuntimeState {
                environment,
                execution_invoker,
                parameters: runtime_parameters,
                server: None,
                setup,
            });
            self.state.store(STATE_STARTED, Ordering::Release);
            tracing::info!("daemon started without server port");
        }

        let addresses = lock(&self.cluster_addresses).clone();
        if self.construct_parameters.acts_as_cluster && !addresses.is_empty() {
            let backoff = lock(&self.backoff).clone();
            *lock(&self.reconnect) = Some(ReconnectPool::start(
                Arc::downgrade(self),
                addresses,
                backoff,
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_server_runtime(
        self: &Arc<Self>,
        environment_parameters: EnvironmentParameters,
        mut runtime_parameters: DaemonLaunchParameters,
        cluster_mirror_directory: Option<PathBuf>,
        port: u16,
        acts_as_server: bool,
        acts_as_cluster: bool,
        slot: &mut DaemonInstanceSlot,
    ) -> Result<RuntimeState, DaemonError> {
        let environment =
            BuildEnvironment::new(environment_parameters).map_err(|err| DaemonError::Startup {
                source: Box::new(err),
            })?;
        let setup: Arc<dyn ConnectionSetup> = Arc::new(DaemonConnectionService::new(
            Arc::downgrade(self),
            acts_as_cluster,
            cluster_mirror_directory.clone(),
        ));
        let server = RpcServer::bind(
            &ServerConfig {
                port,
                bind_all: acts_as_server,
            },
            Arc::clone(&setup),
        )
        .map_err(|err| DaemonError::Startup {
            source: Box::new(err),
        })?;
        let actual_port = server.port();
        slot.publish_port(actual_port)?;

        runtime_parameters.port = Some(i32::from(actual_port));
        runtime_parameters.thread_factor = environment.thread_factor();
        let execution_invoker = ExecutionInvoker::new(Arc::clone(&environment));
        Ok(RuntimeState {
            environment,
            execution_invoker,
            parameters: runtime_parameters,
            server: Some(server),
            setup,
        })
    }

    fn rollback_failed_start(&self) {
        let runtime = lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            if let Some(server) = &runtime.server {
                server.close();
            }
            runtime.environment.close();
        }
        self.state.store(STATE_UNSTARTED, Ordering::Release);
    }

    /// Close the daemon: stop the cluster connectors, the server, the build
    /// environment and release the slot. A no-op unless STARTED.
    pub fn close(&self) {
        let _lifecycle = lock(&self.lifecycle);
        if self.state.load(Ordering::Acquire) != STATE_STARTED {
            return;
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        tracing::debug!("closing daemon environment");

        let pool = lock(&self.reconnect).take();
        if let Some(mut pool) = pool {
            pool.close();
        }
        let runtime = lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            if let Some(server) = &runtime.server {
                server.close();
            }
            self.connection_cache.close();
            self.project_cache.close();
            runtime.environment.close();
        }
        lock(&self.client_invokers).clear();
        *lock(&self.slot) = None;
        tracing::info!("daemon stopped");
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STARTED
    }

    /// Construct-time parameters; available in every state.
    pub fn launch_parameters(&self) -> &DaemonLaunchParameters {
        &self.construct_parameters
    }

    /// Effective configuration finalized during startup.
    pub fn runtime_configuration(&self) -> Result<DaemonLaunchParameters, DaemonError> {
        self.check_started()?;
        lock(&self.runtime)
            .as_ref()
            .map(|runtime| runtime.parameters.clone())
            .ok_or(DaemonError::NotStarted)
    }

    pub fn environment_identifier(&self) -> Result<Uuid, DaemonError> {
        self.check_started()?;
        lock(&self.runtime)
            .as_ref()
            .map(|runtime| runtime.environment.identifier())
            .ok_or(DaemonError::NotStarted)
    }

    pub fn build_environment(&self) -> Result<Arc<BuildEnvironment>, DaemonError> {
        self.check_started()?;
        lock(&self.runtime)
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.environment))
            .ok_or(DaemonError::NotStarted)
    }

    pub fn execution_invoker(&self) -> Result<ExecutionInvoker, DaemonError> {
        self.check_started()?;
        lock(&self.runtime)
            .as_ref()
            .map(|runtime| runtime.execution_invoker.clone())
            .ok_or(DaemonError::NotStarted)
    }

    /// Address of the RPC server, or `None` for portless daemons.
    pub fn server_socket_address(&self) -> Result<Option<SocketAddr>, DaemonError> {
        self.check_started()?;
        Ok(lock(&self.runtime)
            .as_ref()
            .and_then(|runtime| runtime.server.as_ref())
            .map(RpcServer::local_addr))
    }

    pub(super) fn socket_factory(&self) -> Arc<dyn SocketFactory> {
        lock(&self.socket_factory).clone()
    }

    pub(super) fn connection_setup(&self) -> Arc<dyn ConnectionSetup> {
        lock(&self.runtime)
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.setup))
            .unwrap_or_else(|| {
                Arc::new(DaemonConnectionService::new(std::sync::Weak::new(), false, None))
            })
    }

    // ------------------------------------------------------------------
    // Connections and projects
    // ------------------------------------------------------------------

    /// Open (or reuse) a cached connection to the daemon at `address`.
    ///
    /// The returned handle is close-protected: closing it does not affect
    /// the shared cached connection.
    pub fn connect_to(
        &self,
        address: SocketAddr,
    ) -> Result<CloseProtectedRemoteDaemonConnection, DaemonError> {
        self.check_started()?;
        let key = RemoteConnectionCacheKey::new(self.socket_factory(), address);
        self.connection_cache
            .get(&key)
            .map_err(|err| DaemonError::Connect {
                address,
                source: Box::new(err),
            })
    }

    /// Obtain the shared project cache handle of a working directory.
    pub fn get_project(&self, working_directory: PathKey) -> Result<ProjectHandle, DaemonError> {
        self.check_started()?;
        Ok(self
            .project_cache
            .get(&ProjectCacheKey { working_directory })?)
    }

    // ------------------------------------------------------------------
    // Client cluster invoker registrations
    // ------------------------------------------------------------------

    /// Record a cluster invoker registered by the client of `connection_id`.
    pub(super) fn register_client_cluster_invoker(
        &self,
        connection_id: u64,
        environment_identifier: Uuid,
    ) -> u64 {
        let registration_id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            registration = registration_id,
            environment = %environment_identifier,
            "new cluster client registration"
        );
        lock(&self.client_invokers).insert(
            registration_id,
            ClientInvokerRegistration {
                environment_identifier,
                connection_id,
            },
        );
        registration_id
    }

    /// Deterministic cleanup when a client connection closes.
    pub(super) fn remove_client_invokers_of_connection(&self, connection_id: u64) {
        let mut invokers = lock(&self.client_invokers);
        let before = invokers.len();
        invokers.retain(|_, registration| registration.connection_id != connection_id);
        let removed = before - invokers.len();
        if removed > 0 {
            tracing::info!(connection = connection_id, removed, "cluster client disconnected");
        }
    }

    /// The live set of client-registered cluster invokers.
    pub fn client_cluster_task_invoker_factories(&self) -> Vec<ClientInvokerDescriptor> {
        let mut result: Vec<ClientInvokerDescriptor> = lock(&self.client_invokers)
            .iter()
            .map(|(id, registration)| ClientInvokerDescriptor {
                registration_id: *id,
                environment_identifier: registration.environment_identifier,
            })
            .collect();
        result.sort_by_key(|descriptor| descriptor.registration_id);
        result
    }

    // ------------------------------------------------------------------

    fn check_unstarted(&self) -> Result<(), DaemonError> {
        match self.state.load(Ordering::Acquire) {
            STATE_UNSTARTED => Ok(()),
            STATE_STARTED => Err(DaemonError::AlreadyStarted),
            _ => Err(DaemonError::Closed),
        }
    }

    fn check_started(&self) -> Result<(), DaemonError> {
        match self.state.load(Ordering::Acquire) {
            STATE_STARTED => Ok(()),
            STATE_UNSTARTED => Err(DaemonError::NotStarted),
            _ => Err(DaemonError::Closed),
        }
    }
}

impl Drop for DaemonEnvironment {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared cache handle of a project.
///
/// Unlike connection handles, project handles are not close-protected:
/// `close` closes the shared project, and the cache discards it on the next
/// validation.
#[derive(Clone)]
pub struct ProjectHandle {
    project: Arc<ProjectCache>,
}

impl ProjectHandle {
    pub fn project(&self) -> &Arc<ProjectCache> {
        &self.project
    }

    pub fn clean(&self) {
        self.project.clean();
    }

    pub fn reset(&self) {
        self.project.reset();
    }

    pub fn close(&self) {
        self.project.close();
    }

    pub fn is_closed(&self) -> bool {
        self.project.is_closed()
    }
}

/// Cache key of project caches: the working directory path key. The daemon
/// reference is deliberately not part of the identity.
#[derive(Clone, PartialEq, Eq, Hash)]
struct ProjectCacheKey {
    working_directory: PathKey,
}

impl CacheKey for ProjectCacheKey {
    type Resource = ProjectCache;
    type Handle = ProjectHandle;

    fn allocate(&self) -> Result<ProjectCache, CacheError> {
        Ok(ProjectCache::new(self.working_directory.clone()))
    }

    fn generate(&self, resource: &Arc<ProjectCache>) -> ProjectHandle {
        ProjectHandle {
            project: Arc::clone(resource),
        }
    }

    fn validate(&self, _handle: &ProjectHandle, resource: &Arc<ProjectCache>) -> bool {
        !resource.is_closed()
    }

    fn expiry(&self) -> Duration {
        PROJECT_EXPIRY
    }

    fn close(&self, resource: &ProjectCache) {
        resource.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("daemon not yet started")]
    NotStarted,

    #[error("daemon already started")]
    AlreadyStarted,

    #[error("daemon closed")]
    Closed,

    #[error(transparent)]
    SlotLock(#[from] SlotLockError),

    #[error("failed to start daemon: {source}")]
    Startup {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to connect to daemon at {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}
