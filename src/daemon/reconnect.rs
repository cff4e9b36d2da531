//! Outbound cluster connections.
//!
//! One reconnector per configured coordinator address runs on the daemon's
//! cluster-client work pool: dial, fetch the remote daemon access, register
//! this daemon as a cluster task invoker, then leave the connection serving
//! coordinator requests. A connection close listener re-offers the
//! reconnector while the daemon is still started; failures retry with
//! additive backoff. Closing the daemon cancels the shutdown token, which
//! unblocks in-flight sleeps.

use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use crate::rpc::server::{ServerConnection, serve_connection};
use crate::rpc::{CONTEXT_VARIABLE_DAEMON_ACCESS, Request, ResponsePayload, RpcError};

use super::connection::{CONNECT_TIMEOUT, RawClient};
use super::environment::DaemonEnvironment;

/// Cancellation token shared by every reconnector of a daemon.
///
/// The explicit token replaces bulk thread interruption: `cancel` flips the
/// flag and wakes all interruptible sleeps.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    shared: Arc<TokenShared>,
}

#[derive(Default)]
struct TokenShared {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if let Ok(mut cancelled) = self.shared.cancelled.lock() {
            *cancelled = true;
        }
        self.shared.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared
            .cancelled
            .lock()
            .map(|cancelled| *cancelled)
            .unwrap_or(true)
    }

    /// Sleep for `duration`, waking early on cancellation. Returns `false`
    /// when the sleep was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        let Ok(mut cancelled) = self.shared.cancelled.lock() else {
            return false;
        };
        loop {
            if *cancelled {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            match self.shared.wakeup.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return false,
            }
        }
    }
}

/// Backoff of the reconnect loop: additive step with a cap, and a short
/// restart delay after a connection that was established but then failed
/// during setup.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
    pub reset: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            step: Duration::from_secs(5),
            max: Duration::from_secs(30),
            reset: Duration::from_secs(1),
        }
    }
}

/// Work pool of the daemon's outbound cluster connections.
pub struct ReconnectPool {
    tx: Option<Sender<Reconnector>>,
    token: ShutdownToken,
    workers: Vec<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<Arc<ServerConnection>>>>,
}

impl ReconnectPool {
    /// Spawn the pool and enqueue one reconnector per address.
    pub fn start(
        daemon: Weak<DaemonEnvironment>,
        addresses: Vec<SocketAddr>,
        backoff: BackoffConfig,
    ) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded::<Reconnector>();
        let token = ShutdownToken::new();
        let connections = Arc::new(Mutex::new(Vec::new()));

        let worker_count = addresses.len().max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let rx: Receiver<Reconnector> = rx.clone();
            let tx = tx.clone();
            let token = token.clone();
            let connections = Arc::clone(&connections);
            let handle = std::thread::Builder::new()
                .name(format!("cluster-client-{worker}"))
                .spawn(move || {
                    // The worker itself keeps a re-offer sender alive, so the
                    // channel never disconnects on its own; poll the token.
                    loop {
                        match rx.recv_timeout(Duration::from_millis(200)) {
                            Ok(job) => {
                                if token.is_cancelled() {
                                    return;
                                }
                                job.run(&tx, &token, &connections);
                            }
                            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                                if token.is_cancelled() {
                                    return;
                                }
                            }
                            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                        }
                    }
                });
            if let Ok(handle) = handle {
                workers.push(handle);
            }
        }

        for address in addresses {
            let _ = tx.send(Reconnector {
                address,
                daemon: daemon.clone(),
                backoff: backoff.clone(),
            });
        }

        Self {
            tx: Some(tx),
            token,
            workers,
            connections,
        }
    }

    /// Cancel every reconnector, close established outbound connections and
    /// wait for the workers to exit.
    pub fn close(&mut self) {
        self.token.cancel();
        let connections: Vec<Arc<ServerConnection>> = match self.connections.lock() {
            Ok(mut connections) => connections.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for connection in connections {
            connection.close();
        }
        // Dropping our sender disconnects the channel once close listeners
        // have run and released their re-offer senders.
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ReconnectPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// A reconnect task bound to one coordinator address.
#[derive(Clone)]
pub struct Reconnector {
    address: SocketAddr,
    daemon: Weak<DaemonEnvironment>,
    backoff: BackoffConfig,
}

enum EstablishError {
    /// The dial itself failed.
    Dial(std::io::Error),
    /// Connected, but a later handshake step failed.
    Setup(RpcError),
}

impl Reconnector {
    fn run(
        &self,
        tx: &Sender<Reconnector>,
        token: &ShutdownToken,
        connections: &Arc<Mutex<Vec<Arc<ServerConnection>>>>,
    ) {
        let mut sleep = self.backoff.initial;
        loop {
            if token.is_cancelled() {
                break;
            }
            let Some(daemon) = self.daemon.upgrade() else {
                break;
            };
            if !daemon.is_started() {
                break;
            }
            tracing::debug!(addr = %self.address, "connecting as cluster client");
            match self.try_connect(&daemon, tx) {
                Ok(connection) => {
                    tracing::info!(addr = %self.address, "registered as cluster worker");
                    if let Ok(mut connections) = connections.lock() {
                        connections.retain(|existing| !existing.is_closed());
                        connections.push(connection);
                    }
                    // The close listener drives the next attempt.
                    break;
                }
                Err(EstablishError::Dial(err)) => {
                    match err.kind() {
                        std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock => {
                            // Expected while the coordinator is down.
                            tracing::debug!(addr = %self.address, "connect failed: {err}");
                        }
                        std::io::ErrorKind::Interrupted => break,
                        _ => {
                            tracing::warn!(addr = %self.address, "connect failed: {err}");
                        }
                    }
                }
                Err(EstablishError::Setup(err)) => {
                    tracing::warn!(addr = %self.address, "cluster registration failed: {err}");
                    // The connect itself succeeded; restart quickly.
                    sleep = self.backoff.reset;
                }
            }
            tracing::debug!(
                addr = %self.address,
                sleep_ms = sleep.as_millis() as u64,
                "connection failed, backing off"
            );
            if !token.sleep(sleep) {
                break;
            }
            sleep = (sleep + self.backoff.step).min(self.backoff.max);
        }
        tracing::debug!(addr = %self.address, "exiting cluster client connector");
    }

    /// Dial, register this daemon as a cluster invoker on the remote client
    /// server, then leave the socket serving coordinator requests.
    fn try_connect(
        &self,
        daemon: &Arc<DaemonEnvironment>,
        tx: &Sender<Reconnector>,
    ) -> Result<Arc<ServerConnection>, EstablishError> {
        let stream = daemon
            .socket_factory()
            .connect(self.address, CONNECT_TIMEOUT)
            .map_err(EstablishError::Dial)?;
        stream.set_nodelay(true).ok();

        let mut client = RawClient::new(&stream)
            .map_err(|err| EstablishError::Setup(RpcError::Io(err)))?;
        match client.request(&Request::ContextVariable {
            key: CONTEXT_VARIABLE_DAEMON_ACCESS.to_string(),
        }) {
            Ok(ResponsePayload::ContextVariable(payload)) if !payload.variable.is_null() => {}
            Ok(_) => return Err(EstablishError::Setup(RpcError::UnexpectedPayload)),
            Err(err) => return Err(EstablishError::Setup(err)),
        }

        let environment_identifier = daemon
            .environment_identifier()
            .map_err(|_| EstablishError::Setup(RpcError::Disconnected))?;
        match client.request(&Request::RegisterClusterInvoker {
            environment_identifier,
        }) {
            Ok(ResponsePayload::Registered(_)) => {}
            Ok(_) => return Err(EstablishError::Setup(RpcError::UnexpectedPayload)),
            Err(err) => return Err(EstablishError::Setup(err)),
        }

        // Serve mode: the same connection context as an inbound connection,
        // local invoker factory included, so the coordinator can drive task
        // invocations over this socket.
        let setup = daemon.connection_setup();
        let (connection, _handler) = serve_connection(stream, setup)
            .map_err(|err| EstablishError::Setup(RpcError::Io(err)))?;

        let reconnector = self.clone();
        let weak_daemon = Weak::clone(&self.daemon);
        let reoffer = tx.clone();
        connection.add_close_listener(Box::new(move || {
            let Some(daemon) = weak_daemon.upgrade() else {
                return;
            };
            if !daemon.is_started() {
                return;
            }
            // Restart the connection; the pool may be gone already.
            let _ = reoffer.send(reconnector);
        }));
        Ok(connection)
    }
}
