//! Wire protocol types and codec.
//!
//! Protocol: newline-delimited JSON over TCP.
//!
//! Request format: `{"op": "ping", ...}\n`
//! Response format: `{"ok": ...}\n` or `{"err": {"code": "...", "message": "..."}}\n`

pub mod resolver;
pub mod server;

use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::build::{
    ExecutionContext, PathKey, TaskInvocationRequest, TaskInvocationResult, TaskInvokerInformation,
};
use crate::config::DaemonLaunchParameters;

pub use resolver::ResolverRegistry;

pub const PROTOCOL_VERSION: u32 = 1;

/// Context-variable key under which every connection exposes the daemon
/// access descriptor. The literal value is kept for compatibility with
/// daemons already deployed against it.
pub const CONTEXT_VARIABLE_DAEMON_ACCESS: &str = "saker.daemon.access";

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Fetch a context variable attached to this connection.
    ContextVariable { key: String },

    /// Construct-time launch parameters of the daemon.
    LaunchParameters,

    /// Effective configuration finalized during startup.
    RuntimeConfiguration,

    /// Stable UUID of the hosted build environment.
    EnvironmentIdentifier,

    /// Descriptor of the build execution invoker bound to the environment.
    ExecutionInvoker,

    /// Open (or reuse) an outbound connection to another daemon.
    ConnectTo { address: SocketAddr },

    /// Obtain or manage the project cache of a working directory.
    Project {
        working_directory: PathKey,
        action: ProjectAction,
    },

    /// Register the calling client as a cluster task invoker for this
    /// daemon. The registration lives as long as the connection.
    RegisterClusterInvoker { environment_identifier: Uuid },

    /// Enumerate live client-registered cluster invokers.
    ClientClusterInvokers,

    /// Run a batch of task invocations through this connection's cluster
    /// invoker factory.
    InvokeClusterTask {
        execution_context: ExecutionContext,
        invoker_information: TaskInvokerInformation,
        #[serde(default)]
        requests: Vec<TaskInvocationRequest>,
    },

    /// Health check.
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectAction {
    Open,
    Clean,
    Reset,
    Close,
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: ResponsePayload },
    Err { err: ErrorPayload },
}

impl Response {
    pub fn ok(payload: ResponsePayload) -> Self {
        Response::Ok { ok: payload }
    }

    pub fn err(error: impl Into<ErrorPayload>) -> Self {
        Response::Err { err: error.into() }
    }
}

/// Successful response payload.
///
/// Untagged; every variant is a wrapper struct with a distinct field name so
/// deserialization stays unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    ContextVariable(ContextVariablePayload),
    Parameters(ParametersPayload),
    Identifier(IdentifierPayload),
    Invoker(InvokerPayload),
    Connected(ConnectedPayload),
    Project(ProjectPayload),
    Registered(RegisteredPayload),
    ClientInvokers(ClientInvokersPayload),
    Invoked(InvokedPayload),
    Pong(PongPayload),
}

/// A context variable value; `null` when the key is not attached. The field
/// is required (not `Option`) so the untagged payload decoding stays
/// unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextVariablePayload {
    pub variable: serde_json::Value,
}

/// The daemon access descriptor published under
/// [`CONTEXT_VARIABLE_DAEMON_ACCESS`] on every accepted connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonAccess {
    /// Environment identifier of the daemon behind this connection.
    pub daemon_environment: Uuid,
    pub protocol_version: u32,
    /// Environment identifier advertised by the connection's cluster task
    /// invoker factory; `None` when the daemon does not act as a cluster.
    pub cluster_task_invoker: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametersPayload {
    pub parameters: DaemonLaunchParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierPayload {
    pub environment_identifier: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerPayload {
    pub execution_invoker: InvokerDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerDescriptor {
    pub environment_identifier: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub connected: ConnectedDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedDescriptor {
    pub address: SocketAddr,
    pub remote_environment: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPayload {
    pub project: ProjectDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub working_directory: PathKey,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub registration_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInvokersPayload {
    pub client_invokers: Vec<ClientInvokerDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInvokerDescriptor {
    pub registration_id: u64,
    pub environment_identifier: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokedPayload {
    pub results: Vec<TaskInvocationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PongPayload {
    result: PongTag,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
enum PongTag {
    #[default]
    #[serde(rename = "pong")]
    Pong,
}

impl ResponsePayload {
    pub fn pong() -> Self {
        ResponsePayload::Pong(PongPayload::default())
    }
}

/// Error response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

// =============================================================================
// RpcError
// =============================================================================

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("unexpected response payload")]
    UnexpectedPayload,
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Parse(_) => "parse_error",
            RpcError::Io(_) => "io_error",
            RpcError::Disconnected => "disconnected",
            RpcError::Remote { .. } => "remote_error",
            RpcError::UnexpectedPayload => "unexpected_payload",
        }
    }
}

impl From<RpcError> for ErrorPayload {
    fn from(err: RpcError) -> Self {
        ErrorPayload::new(err.code(), err.to_string())
    }
}

// =============================================================================
// Codec
// =============================================================================

pub fn encode_request(request: &Request) -> Result<Vec<u8>, RpcError> {
    let mut bytes = serde_json::to_vec(request)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_request(line: &str) -> Result<Request, RpcError> {
    Ok(serde_json::from_str(line)?)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, RpcError> {
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_response(line: &str) -> Result<Response, RpcError> {
    Ok(serde_json::from_str(line)?)
}

pub fn send_request(stream: &mut TcpStream, request: &Request) -> Result<(), RpcError> {
    let bytes = encode_request(request)?;
    stream.write_all(&bytes)?;
    Ok(())
}

pub fn send_response(stream: &mut TcpStream, response: &Response) -> Result<(), RpcError> {
    let bytes = encode_response(response)?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Turn a decoded response into its payload, mapping remote errors.
pub fn into_payload(response: Response) -> Result<ResponsePayload, RpcError> {
    match response {
        Response::Ok { ok } => Ok(ok),
        Response::Err { err } => Err(RpcError::Remote {
            code: err.code,
            message: err.message,
        }),
    }
}
