//! RPC server and per-connection state.
//!
//! The server binds first and accepts later: `bind` learns the local address
//! (so the daemon can publish the port into its slot before any client can
//! connect) and `start` begins the accept loop. Every accepted socket gets a
//! [`ServerConnection`] carrying context variables, a resolver registry and
//! close listeners, plus a dedicated handler thread.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::resolver::ResolverRegistry;
use super::{ErrorPayload, Request, Response, decode_request, encode_response};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Hooks the daemon installs on the server.
pub trait ConnectionSetup: Send + Sync + 'static {
    /// Wire per-connection context right after the socket is accepted,
    /// before the first request is read.
    fn setup_connection(&self, connection: &Arc<ServerConnection>);

    /// Dispatch one request.
    fn handle_request(&self, connection: &Arc<ServerConnection>, request: Request) -> Response;
}

/// State attached to one connection, inbound or outbound.
pub struct ServerConnection {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    context: Mutex<HashMap<String, serde_json::Value>>,
    resolvers: Arc<ResolverRegistry>,
    close_listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    requests: AtomicU64,
    errors: AtomicU64,
    closed: AtomicBool,
}

impl ServerConnection {
    fn new(stream: TcpStream, peer: SocketAddr) -> std::io::Result<Arc<Self>> {
        let writer = stream.try_clone()?;
        Ok(Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            stream,
            writer: Mutex::new(writer),
            context: Mutex::new(HashMap::new()),
            resolvers: Arc::new(ResolverRegistry::new()),
            close_listeners: Mutex::new(Vec::new()),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn resolver_registry(&self) -> &Arc<ResolverRegistry> {
        &self.resolvers
    }

    pub fn put_context_variable(&self, key: impl Into<String>, value: serde_json::Value) {
        if let Ok(mut context) = self.context.lock() {
            context.insert(key.into(), value);
        }
    }

    pub fn context_variable(&self, key: &str) -> Option<serde_json::Value> {
        self.context.lock().ok()?.get(key).cloned()
    }

    /// Run `listener` when the connection goes away, whatever the cause.
    /// Listeners added after close run immediately.
    pub fn add_close_listener(&self, listener: Box<dyn FnOnce() + Send>) {
        if self.closed.load(Ordering::Acquire) {
            listener();
            return;
        }
        if let Ok(mut listeners) = self.close_listeners.lock() {
            listeners.push(listener);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut the socket down; the handler thread observes the read failure
    /// and runs the close listeners.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn write_response(&self, response: &Response) -> Result<(), super::RpcError> {
        use std::io::Write;
        let bytes = encode_response(response)?;
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn run_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        tracing::debug!(
            connection = self.id,
            peer = %self.peer,
            requests = self.requests.load(Ordering::Relaxed),
            errors = self.errors.load(Ordering::Relaxed),
            "connection closed"
        );
        let listeners: Vec<Box<dyn FnOnce() + Send>> = match self.close_listeners.lock() {
            Ok(mut listeners) => listeners.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for listener in listeners {
            listener();
        }
    }
}

/// Wire up and serve an already-established socket.
///
/// Used for every accepted connection, and by cluster workers to serve
/// coordinator requests on a dialed socket after registering themselves.
pub fn serve_connection(
    stream: TcpStream,
    setup: Arc<dyn ConnectionSetup>,
) -> std::io::Result<(Arc<ServerConnection>, JoinHandle<()>)> {
    let peer = stream.peer_addr()?;
    let connection = ServerConnection::new(stream, peer)?;
    setup.setup_connection(&connection);
    let handler_connection = Arc::clone(&connection);
    let handle = std::thread::Builder::new()
        .name(format!("rpc-conn-{}", connection.id()))
        .spawn(move || connection_loop(&handler_connection, setup.as_ref()))?;
    Ok((connection, handle))
}

fn connection_loop(connection: &Arc<ServerConnection>, setup: &dyn ConnectionSetup) {
    let reader = match connection.stream.try_clone() {
        Ok(reader) => BufReader::new(reader),
        Err(err) => {
            tracing::error!(connection = connection.id, "failed to clone stream: {err}");
            connection.run_close();
            return;
        }
    };

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        connection.requests.fetch_add(1, Ordering::Relaxed);
        let response = match decode_request(&line) {
            Ok(request) => setup.handle_request(connection, request),
            Err(err) => Response::err(ErrorPayload::new("parse_error", err.to_string())),
        };
        if matches!(response, Response::Err { .. }) {
            connection.errors.fetch_add(1, Ordering::Relaxed);
        }
        if connection.write_response(&response).is_err() {
            break;
        }
    }
    connection.run_close();
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind; `0` binds an ephemeral port.
    pub port: u16,
    /// Bind all interfaces instead of loopback only.
    pub bind_all: bool,
}

struct ServerShared {
    shutdown: AtomicBool,
    connections: Mutex<Vec<(Arc<ServerConnection>, JoinHandle<()>)>>,
}

/// The daemon's RPC server.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    setup: Arc<dyn ConnectionSetup>,
    shared: Arc<ServerShared>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind the listening socket without accepting anything yet.
    pub fn bind(config: &ServerConfig, setup: Arc<dyn ConnectionSetup>) -> std::io::Result<Self> {
        let bind_ip = if config.bind_all {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::LOCALHOST
        };
        let listener = TcpListener::bind((bind_ip, config.port))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            local_addr,
            setup,
            shared: Arc::new(ServerShared {
                shutdown: AtomicBool::new(false),
                connections: Mutex::new(Vec::new()),
            }),
            accept_handle: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Begin accepting connections.
    pub fn start(&self) -> std::io::Result<()> {
        let listener = self.listener.try_clone()?;
        let shared = Arc::clone(&self.shared);
        let setup = Arc::clone(&self.setup);
        let handle = std::thread::Builder::new()
            .name("rpc-accept".to_string())
            .spawn(move || accept_loop(&listener, &shared, &setup))?;
        if let Ok(mut accept) = self.accept_handle.lock() {
            *accept = Some(handle);
        }
        Ok(())
    }

    /// Stop accepting and close every live connection.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let handle = self
            .accept_handle
            .lock()
            .ok()
            .and_then(|mut accept| accept.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let connections: Vec<(Arc<ServerConnection>, JoinHandle<()>)> =
            match self.shared.connections.lock() {
                Ok(mut connections) => connections.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            };
        for (connection, _) in &connections {
            connection.close();
        }
        for (_, handle) in connections {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: &TcpListener, shared: &ServerShared, setup: &Arc<dyn ConnectionSetup>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                tracing::debug!(%peer, "accepted connection");
                match serve_connection(stream, Arc::clone(setup)) {
                    Ok(entry) => {
                        if let Ok(mut connections) = shared.connections.lock() {
                            // Drop entries whose handler has already finished.
                            connections.retain(|(_, handle)| !handle.is_finished());
                            connections.push(entry);
                        }
                    }
                    Err(err) => {
                        tracing::error!(%peer, "failed to set up connection: {err}");
                    }
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                tracing::error!("accept error: {err}");
            }
        }
    }
}
