//! Connection-side daemon service.
//!
//! Wires per-connection context when a socket is accepted (or when an
//! outbound cluster connection enters serve mode): the daemon access context
//! variable, a `DaemonClientServer` for client-side registrations, and a
//! cluster invoker factory when the daemon acts as a cluster. Also dispatches
//! every request of the wire protocol.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::build::BuildTrace;
use crate::rpc::server::{ConnectionSetup, ServerConnection};
use crate::rpc::{
    CONTEXT_VARIABLE_DAEMON_ACCESS, ClientInvokersPayload, ConnectedDescriptor, ConnectedPayload,
    ContextVariablePayload, DaemonAccess, ErrorPayload, IdentifierPayload, InvokedPayload,
    InvokerDescriptor, InvokerPayload, PROTOCOL_VERSION, ParametersPayload, ProjectAction,
    ProjectDescriptor, ProjectPayload, RegisteredPayload, Request, Response, ResponsePayload,
};

use super::environment::{DaemonEnvironment, DaemonError};
use super::invoker::{ClusterInvokerFactory, InvokeError, TaskInvocationContext};

/// Per-connection server-side registration surface.
///
/// Client-registered cluster invokers are recorded on the daemon and removed
/// deterministically by the connection close listener; their lifetime is
/// bounded by the underlying connection.
pub struct DaemonClientServer {
    daemon: Weak<DaemonEnvironment>,
    connection_id: u64,
}

impl DaemonClientServer {
    fn new(daemon: Weak<DaemonEnvironment>, connection_id: u64) -> Self {
        Self {
            daemon,
            connection_id,
        }
    }

    pub fn add_client_cluster_task_invoker_factory(
        &self,
        environment_identifier: Uuid,
    ) -> Option<u64> {
        let daemon = self.daemon.upgrade()?;
        Some(daemon.register_client_cluster_invoker(self.connection_id, environment_identifier))
    }
}

struct ConnectionState {
    client_server: DaemonClientServer,
    cluster_invoker_factory: Option<Arc<ClusterInvokerFactory>>,
}

pub struct DaemonConnectionService {
    daemon: Weak<DaemonEnvironment>,
    acts_as_cluster: bool,
    cluster_mirror_directory: Option<PathBuf>,
    connections: Arc<Mutex<HashMap<u64, ConnectionState>>>,
}

impl DaemonConnectionService {
    pub fn new(
        daemon: Weak<DaemonEnvironment>,
        acts_as_cluster: bool,
        cluster_mirror_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            daemon,
            acts_as_cluster,
            cluster_mirror_directory,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn with_state<R>(
        &self,
        connection_id: u64,
        f: impl FnOnce(&ConnectionState) -> R,
    ) -> Option<R> {
        let connections = self.connections.lock().ok()?;
        connections.get(&connection_id).map(f)
    }
}

impl ConnectionSetup for DaemonConnectionService {
    fn setup_connection(&self, connection: &Arc<ServerConnection>) {
        let Some(daemon) = self.daemon.upgrade() else {
            return;
        };
        let Ok(environment_identifier) = daemon.environment_identifier() else {
            return;
        };

        let cluster_invoker_factory = if self.acts_as_cluster {
            Some(Arc::new(ClusterInvokerFactory::new(
                self.daemon.clone(),
                Arc::clone(connection.resolver_registry()),
                self.cluster_mirror_directory.clone(),
                environment_identifier,
            )))
        } else {
            None
        };

        let access = DaemonAccess {
            daemon_environment: environment_identifier,
            protocol_version: PROTOCOL_VERSION,
            cluster_task_invoker: cluster_invoker_factory
                .as_ref()
                .map(|factory| factory.environment_identifier()),
        };
        if let Ok(value) = serde_json::to_value(&access) {
            connection.put_context_variable(CONTEXT_VARIABLE_DAEMON_ACCESS, value);
        }

        let connection_id = connection.id();
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(
                connection_id,
                ConnectionState {
                    client_server: DaemonClientServer::new(self.daemon.clone(), connection_id),
                    cluster_invoker_factory,
                },
            );
        }

        // Deterministic cleanup: registrations of this connection disappear
        // with it, whether it closed cleanly or by error.
        let weak = self.daemon.clone();
        let states = Arc::clone(&self.connections);
        connection.add_close_listener(Box::new(move || {
            if let Some(daemon) = weak.upgrade() {
                daemon.remove_client_invokers_of_connection(connection_id);
            }
            if let Ok(mut states) = states.lock() {
                states.remove(&connection_id);
            }
        }));
    }

    fn handle_request(&self, connection: &Arc<ServerConnection>, request: Request) -> Response {
        let Some(daemon) = self.daemon.upgrade() else {
            return Response::err(ErrorPayload::new("unavailable", "daemon is shutting down"));
        };
        match request {
            Request::ContextVariable { key } => {
                let variable = connection
                    .context_variable(&key)
                    .unwrap_or(serde_json::Value::Null);
                Response::ok(ResponsePayload::ContextVariable(ContextVariablePayload {
                    variable,
                }))
            }

            Request::LaunchParameters => {
                Response::ok(ResponsePayload::Parameters(ParametersPayload {
                    parameters: daemon.launch_parameters().clone(),
                }))
            }

            Request::RuntimeConfiguration => match daemon.runtime_configuration() {
                Ok(parameters) => {
                    Response::ok(ResponsePayload::Parameters(ParametersPayload { parameters }))
                }
                Err(err) => error_response(&err),
            },

            Request::EnvironmentIdentifier => match daemon.environment_identifier() {
                Ok(environment_identifier) => {
                    Response::ok(ResponsePayload::Identifier(IdentifierPayload {
                        environment_identifier,
                    }))
                }
                Err(err) => error_response(&err),
            },

            Request::ExecutionInvoker => match daemon.execution_invoker() {
                Ok(invoker) => Response::ok(ResponsePayload::Invoker(InvokerPayload {
                    execution_invoker: InvokerDescriptor {
                        environment_identifier: invoker.environment_identifier(),
                    },
                })),
                Err(err) => error_response(&err),
            },

            Request::ConnectTo { address } => match daemon.connect_to(address) {
                Ok(handle) => Response::ok(ResponsePayload::Connected(ConnectedPayload {
                    connected: ConnectedDescriptor {
                        address: handle.address(),
                        remote_environment: handle.environment_identifier(),
                    },
                })),
                Err(err) => error_response(&err),
            },

            Request::Project {
                working_directory,
                action,
            } => match daemon.get_project(working_directory) {
                Ok(handle) => {
                    match action {
                        ProjectAction::Open => {}
                        ProjectAction::Clean => handle.clean(),
                        ProjectAction::Reset => handle.reset(),
                        ProjectAction::Close => handle.close(),
                    }
                    Response::ok(ResponsePayload::Project(ProjectPayload {
                        project: ProjectDescriptor {
                            working_directory: handle.project().working_directory().clone(),
                            closed: handle.is_closed(),
                        },
                    }))
                }
                Err(err) => error_response(&err),
            },

            Request::RegisterClusterInvoker {
                environment_identifier,
            } => {
                let registered = self.with_state(connection.id(), |state| {
                    state
                        .client_server
                        .add_client_cluster_task_invoker_factory(environment_identifier)
                });
                match registered.flatten() {
                    Some(registration_id) => {
                        Response::ok(ResponsePayload::Registered(RegisteredPayload {
                            registration_id,
                        }))
                    }
                    None => Response::err(ErrorPayload::new(
                        "unavailable",
                        "connection is not registered with the daemon",
                    )),
                }
            }

            Request::ClientClusterInvokers => {
                Response::ok(ResponsePayload::ClientInvokers(ClientInvokersPayload {
                    client_invokers: daemon.client_cluster_task_invoker_factories(),
                }))
            }

            Request::InvokeClusterTask {
                execution_context,
                invoker_information,
                requests,
            } => {
                let factory = self
                    .with_state(connection.id(), |state| {
                        state.cluster_invoker_factory.clone()
                    })
                    .flatten();
                let Some(factory) = factory else {
                    return Response::err(ErrorPayload::new(
                        "cluster_unsupported",
                        "daemon does not act as a cluster",
                    ));
                };
                let invocation =
                    match factory.create_task_invoker(execution_context, invoker_information) {
                        Ok(invocation) => invocation,
                        Err(err) => return invoke_error_response(&err),
                    };
                match invocation.run(TaskInvocationContext {
                    trace: BuildTrace::new(),
                    requests,
                }) {
                    Ok(results) => {
                        Response::ok(ResponsePayload::Invoked(InvokedPayload { results }))
                    }
                    Err(err) => invoke_error_response(&err),
                }
            }

            Request::Ping => Response::ok(ResponsePayload::pong()),
        }
    }
}

fn error_response(err: &DaemonError) -> Response {
    let code = match err {
        DaemonError::Config(_) => "invalid_configuration",
        DaemonError::NotStarted => "not_started",
        DaemonError::AlreadyStarted => "already_started",
        DaemonError::Closed => "closed",
        DaemonError::SlotLock(_) => "lock_error",
        DaemonError::Startup { .. } => "startup_error",
        DaemonError::Connect { .. } => "connect_error",
        DaemonError::Cache(_) => "cache_error",
    };
    Response::err(ErrorPayload::new(code, err.to_string()))
}

fn invoke_error_response(err: &InvokeError) -> Response {
    let code = match err {
        InvokeError::ClusterStart(_) => "cluster_start_error",
        InvokeError::Project { .. } => "project_error",
        InvokeError::DaemonUnavailable => "unavailable",
    };
    Response::err(ErrorPayload::new(code, err.to_string()))
}
