//! Client side of daemon-to-daemon connections.
//!
//! A [`RemoteDaemonConnection`] owns the dialed socket and the access
//! descriptor fetched during the handshake. Closing it closes the connection,
//! never the remote daemon. Connections obtained through the daemon's cache
//! are handed out as [`CloseProtectedRemoteDaemonConnection`] so incidental
//! callers cannot tear down the shared resource.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::cache::{CacheError, CacheKey};
use crate::config::DaemonLaunchParameters;
use crate::rpc::{
    CONTEXT_VARIABLE_DAEMON_ACCESS, DaemonAccess, Request, ResponsePayload, RpcError,
    decode_response, encode_request, into_payload,
};

/// Linger of cached remote connections.
pub const CONNECTION_EXPIRY: Duration = Duration::from_secs(5 * 60);

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces the sockets used for outbound connections.
///
/// Factory identity matters: the connection cache keys on the factory
/// instance, so two distinct factories never share cached connections even
/// when they would produce equivalent sockets.
pub trait SocketFactory: Send + Sync + 'static {
    fn connect(&self, address: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream>;
}

pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn connect(&self, address: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
        TcpStream::connect_timeout(&address, timeout)
    }
}

/// Request/response plumbing over one socket; used by the established
/// connection type below and by the cluster reconnector's handshake phase.
pub(crate) struct RawClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawClient {
    pub(crate) fn new(stream: &TcpStream) -> std::io::Result<Self> {
        Ok(Self {
            writer: stream.try_clone()?,
            reader: BufReader::new(stream.try_clone()?),
        })
    }

    pub(crate) fn request(&mut self, request: &Request) -> Result<ResponsePayload, RpcError> {
        let bytes = encode_request(request)?;
        self.writer.write_all(&bytes)?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(RpcError::Disconnected);
        }
        into_payload(decode_response(line.trim_end())?)
    }
}

/// An established connection to another daemon.
pub struct RemoteDaemonConnection {
    address: SocketAddr,
    io: Mutex<RawClient>,
    shutdown_handle: TcpStream,
    connected: AtomicBool,
    access: DaemonAccess,
    error_listeners: Mutex<Vec<Box<dyn Fn(&RpcError) + Send + Sync>>>,
}

impl RemoteDaemonConnection {
    /// Dial `address` and perform the access handshake.
    pub fn connect(factory: &dyn SocketFactory, address: SocketAddr) -> Result<Self, RpcError> {
        let stream = factory.connect(address, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true).ok();
        let shutdown_handle = stream.try_clone()?;
        let mut io = RawClient::new(&stream)?;

        let payload = io.request(&Request::ContextVariable {
            key: CONTEXT_VARIABLE_DAEMON_ACCESS.to_string(),
        })?;
        let ResponsePayload::ContextVariable(variable) = payload else {
            return Err(RpcError::UnexpectedPayload);
        };
        if variable.variable.is_null() {
            return Err(RpcError::Remote {
                code: "no_daemon_access".to_string(),
                message: format!("no daemon environment found at {address}"),
            });
        }
        let access: DaemonAccess = serde_json::from_value(variable.variable)?;

        Ok(Self {
            address,
            io: Mutex::new(io),
            shutdown_handle,
            connected: AtomicBool::new(true),
            access,
            error_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Environment identifier of the remote daemon.
    pub fn environment_identifier(&self) -> Uuid {
        self.access.daemon_environment
    }

    /// Environment identifier of the remote cluster invoker factory, when
    /// the remote daemon acts as a cluster.
    pub fn cluster_task_invoker(&self) -> Option<Uuid> {
        self.access.cluster_task_invoker
    }

    pub fn add_connection_io_error_listener(
        &self,
        listener: Box<dyn Fn(&RpcError) + Send + Sync>,
    ) {
        if let Ok(mut listeners) = self.error_listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Issue one request and wait for the response.
    pub fn request(&self, request: &Request) -> Result<ResponsePayload, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::Disconnected);
        }
        let mut io = self.lock_io();
        match io.request(request) {
            Ok(payload) => Ok(payload),
            Err(err) => {
                if io_failure(&err) {
                    drop(io);
                    self.mark_disconnected(&err);
                }
                Err(err)
            }
        }
    }

    pub fn launch_parameters(&self) -> Result<DaemonLaunchParameters, RpcError> {
        match self.request(&Request::LaunchParameters)? {
            ResponsePayload::Parameters(payload) => Ok(payload.parameters),
            _ => Err(RpcError::UnexpectedPayload),
        }
    }

    pub fn runtime_configuration(&self) -> Result<DaemonLaunchParameters, RpcError> {
        match self.request(&Request::RuntimeConfiguration)? {
            ResponsePayload::Parameters(payload) => Ok(payload.parameters),
            _ => Err(RpcError::UnexpectedPayload),
        }
    }

    /// Close this connection. The remote daemon keeps running.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);
    }

    fn mark_disconnected(&self, err: &RpcError) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.shutdown_handle.shutdown(Shutdown::Both);
            if let Ok(listeners) = self.error_listeners.lock() {
                for listener in listeners.iter() {
                    listener(err);
                }
            }
        }
    }

    fn lock_io(&self) -> MutexGuard<'_, RawClient> {
        match self.io.lock() {
            Ok(io) => io,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn io_failure(err: &RpcError) -> bool {
    matches!(err, RpcError::Io(_) | RpcError::Disconnected)
}

/// Wrapper over a shared cached connection whose `close` is a no-op.
#[derive(Clone)]
pub struct CloseProtectedRemoteDaemonConnection {
    subject: Arc<RemoteDaemonConnection>,
}

impl CloseProtectedRemoteDaemonConnection {
    pub fn address(&self) -> SocketAddr {
        self.subject.address()
    }

    pub fn is_connected(&self) -> bool {
        self.subject.is_connected()
    }

    pub fn environment_identifier(&self) -> Uuid {
        self.subject.environment_identifier()
    }

    pub fn cluster_task_invoker(&self) -> Option<Uuid> {
        self.subject.cluster_task_invoker()
    }

    pub fn add_connection_io_error_listener(
        &self,
        listener: Box<dyn Fn(&RpcError) + Send + Sync>,
    ) {
        self.subject.add_connection_io_error_listener(listener);
    }

    pub fn request(&self, request: &Request) -> Result<ResponsePayload, RpcError> {
        self.subject.request(request)
    }

    pub fn launch_parameters(&self) -> Result<DaemonLaunchParameters, RpcError> {
        self.subject.launch_parameters()
    }

    pub fn runtime_configuration(&self) -> Result<DaemonLaunchParameters, RpcError> {
        self.subject.runtime_configuration()
    }

    /// Does not close the underlying shared connection.
    pub fn close(&self) {}
}

/// Cache key of outbound daemon connections.
///
/// Equality uses address equality plus identity of the socket factory: two
/// distinct factories producing equivalent sockets are intentionally
/// separate cache entries.
#[derive(Clone)]
pub struct RemoteConnectionCacheKey {
    socket_factory: Arc<dyn SocketFactory>,
    address: SocketAddr,
}

impl std::fmt::Debug for RemoteConnectionCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnectionCacheKey")
            .field("socket_factory", &(Arc::as_ptr(&self.socket_factory) as *const ()))
            .field("address", &self.address)
            .finish()
    }
}

impl RemoteConnectionCacheKey {
    pub fn new(socket_factory: Arc<dyn SocketFactory>, address: SocketAddr) -> Self {
        Self {
            socket_factory,
            address,
        }
    }

    fn factory_identity(&self) -> *const () {
        Arc::as_ptr(&self.socket_factory).cast::<()>()
    }
}

impl PartialEq for RemoteConnectionCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && std::ptr::eq(self.factory_identity(), other.factory_identity())
    }
}

impl Eq for RemoteConnectionCacheKey {}

impl std::hash::Hash for RemoteConnectionCacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        (self.factory_identity() as usize).hash(state);
    }
}

impl CacheKey for RemoteConnectionCacheKey {
    type Resource = RemoteDaemonConnection;
    type Handle = CloseProtectedRemoteDaemonConnection;

    fn allocate(&self) -> Result<RemoteDaemonConnection, CacheError> {
        RemoteDaemonConnection::connect(self.socket_factory.as_ref(), self.address)
            .map_err(|err| CacheError::Allocate(Box::new(err)))
    }

    fn generate(&self, resource: &Arc<RemoteDaemonConnection>) -> Self::Handle {
        CloseProtectedRemoteDaemonConnection {
            subject: Arc::clone(resource),
        }
    }

    fn validate(&self, _handle: &Self::Handle, resource: &Arc<RemoteDaemonConnection>) -> bool {
        resource.is_connected()
    }

    fn expiry(&self) -> Duration {
        CONNECTION_EXPIRY
    }

    fn close(&self, resource: &RemoteDaemonConnection) {
        resource.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_uses_factory_identity() {
        let address: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let factory_a: Arc<dyn SocketFactory> = Arc::new(DefaultSocketFactory);
        let factory_b: Arc<dyn SocketFactory> = Arc::new(DefaultSocketFactory);

        let a1 = RemoteConnectionCacheKey::new(Arc::clone(&factory_a), address);
        let a2 = RemoteConnectionCacheKey::new(Arc::clone(&factory_a), address);
        let b = RemoteConnectionCacheKey::new(Arc::clone(&factory_b), address);

        assert_eq!(a1, a2);
        assert_ne!(a1, b);

        let other: SocketAddr = "127.0.0.1:4243".parse().unwrap();
        let a3 = RemoteConnectionCacheKey::new(factory_a, other);
        assert_ne!(a1, a3);
    }
}
