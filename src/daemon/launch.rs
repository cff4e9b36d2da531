//! Connecting to or spawning daemons.
//!
//! `daemon start` first enumerates the lock file; when the requested port is
//! already published it connects and compares launch parameters, otherwise
//! it spawns a `daemon run` child and waits up to three seconds for the
//! first-line handshake on the child's stdout.

use std::io::BufRead;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::config::DaemonLaunchParameters;
use crate::rpc::RpcError;

use super::connection::{DefaultSocketFactory, RemoteDaemonConnection};
use super::slot_lock::{SlotLockError, running_daemon_ports};

/// First stdout line of a server daemon, followed by the decimal port.
pub const FIRST_LINE_SERVER_PREFIX: &str = "kiln daemon listening on port: ";

/// First stdout line of a portless daemon.
pub const FIRST_LINE_NO_SERVER: &str = "kiln daemon running without server port";

const FIRST_LINE_TIMEOUT: Duration = Duration::from_secs(3);

/// The handshake line `daemon run` prints before anything else.
pub fn first_line_for(port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{FIRST_LINE_SERVER_PREFIX}{port}"),
        None => FIRST_LINE_NO_SERVER.to_string(),
    }
}

pub fn parse_first_line_port(line: &str) -> Option<u16> {
    line.strip_prefix(FIRST_LINE_SERVER_PREFIX)?
        .trim()
        .parse()
        .ok()
}

/// Outcome of [`start_daemon`].
#[derive(Debug)]
pub enum StartOutcome {
    /// A daemon with identical parameters was already running.
    AlreadyRunning { port: u16 },
    /// A new daemon process was spawned.
    Started { port: u16 },
}

/// Ensure a daemon with `params` is running, spawning `program daemon run`
/// when necessary.
pub fn start_daemon(
    program: &Path,
    params: &DaemonLaunchParameters,
) -> Result<StartOutcome, LaunchError> {
    let Some(port) = params.effective_port() else {
        return Err(LaunchError::NoServerPort);
    };

    // Probe for an already-running daemon. Transient RPC failures here mean
    // the listed daemon is unusable; treat them as "no daemon there".
    if let Ok(ports) = enumerate(params)
        && ports.contains(&port)
    {
        match RemoteDaemonConnection::connect(&DefaultSocketFactory, loopback(port)) {
            Ok(connection) => {
                let running = connection.launch_parameters()?;
                connection.close();
                if &running != params {
                    return Err(LaunchError::DifferentParameters {
                        running: Box::new(running),
                    });
                }
                return Ok(StartOutcome::AlreadyRunning { port });
            }
            Err(err) => {
                tracing::debug!("listed daemon not reachable, starting a new one: {err}");
            }
        }
    }

    let connection = connect_or_spawn(program, params)?;
    let running = connection.launch_parameters()?;
    let port = connection.address().port();
    connection.close();
    if &running != params {
        return Err(LaunchError::DifferentParameters {
            running: Box::new(running),
        });
    }
    Ok(StartOutcome::Started { port })
}

/// Connect to the daemon described by `params`, spawning it when no running
/// daemon publishes the requested port.
pub fn connect_or_spawn(
    program: &Path,
    params: &DaemonLaunchParameters,
) -> Result<RemoteDaemonConnection, LaunchError> {
    let Some(port) = params.effective_port() else {
        return Err(LaunchError::NoServerPort);
    };
    let ports = enumerate(params)?;
    if ports.contains(&port) {
        return Ok(RemoteDaemonConnection::connect(
            &DefaultSocketFactory,
            loopback(port),
        )?);
    }

    let mut command = Command::new(program);
    command.args(launch_arguments(params, &[]));
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = command.spawn().map_err(LaunchError::Spawn)?;
    let Some(stdout) = child.stdout.take() else {
        return Err(LaunchError::Handshake("no stdout from child".to_string()));
    };

    // Read on a separate thread so the handshake wait can time out.
    let (tx, rx) = crossbeam::channel::bounded::<String>(1);
    std::thread::spawn(move || {
        let mut reader = std::io::BufReader::new(stdout);
        let mut line = String::new();
        let _ = reader.read_line(&mut line);
        let _ = tx.send(line);
    });
    let line = rx
        .recv_timeout(FIRST_LINE_TIMEOUT)
        .map_err(|_| LaunchError::HandshakeTimeout)?;
    let line = line.trim_end();
    if line == FIRST_LINE_NO_SERVER {
        return Err(LaunchError::NoServerPort);
    }
    let Some(child_port) = parse_first_line_port(line) else {
        return Err(LaunchError::Handshake(line.to_string()));
    };
    Ok(RemoteDaemonConnection::connect(
        &DefaultSocketFactory,
        loopback(child_port),
    )?)
}

/// `daemon run` argument list reproducing `params`.
pub fn launch_arguments(
    params: &DaemonLaunchParameters,
    connect_addresses: &[SocketAddr],
) -> Vec<String> {
    let mut args = vec!["daemon".to_string(), "run".to_string()];
    if let Some(storage) = &params.storage_directory {
        args.push("--storage-directory".to_string());
        args.push(storage.display().to_string());
    }
    if params.acts_as_server {
        args.push("--server".to_string());
    }
    if let Some(port) = params.port {
        args.push("--port".to_string());
        args.push(port.to_string());
    }
    if params.thread_factor > 0 {
        args.push("--thread-factor".to_string());
        args.push(params.thread_factor.to_string());
    }
    if params.acts_as_cluster {
        args.push("--cluster-enable".to_string());
    }
    if let Some(mirror) = &params.cluster_mirror_directory {
        args.push("--cluster-mirror-directory".to_string());
        args.push(mirror.display().to_string());
    }
    for (key, value) in &params.user_parameters {
        args.push("-U".to_string());
        args.push(format!("{key}={value}"));
    }
    for address in connect_addresses {
        args.push("--connect-client".to_string());
        args.push(address.to_string());
    }
    args
}

fn enumerate(params: &DaemonLaunchParameters) -> Result<Vec<u16>, LaunchError> {
    let storage = crate::paths::resolve_storage_directory(
        &params
            .storage_directory
            .clone()
            .unwrap_or_else(crate::paths::default_storage_directory),
    );
    running_daemon_ports(&storage).map_err(|source| LaunchError::Enumerate {
        path: storage,
        source,
    })
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LaunchError {
    #[error("cannot connect to a daemon without a server port")]
    NoServerPort,

    #[error("failed to determine daemon state at {path:?}: {source}")]
    Enumerate {
        path: PathBuf,
        #[source]
        source: SlotLockError,
    },

    #[error("daemon is already running with different parameters")]
    DifferentParameters { running: Box<DaemonLaunchParameters> },

    #[error("failed to start daemon, timed out waiting for the handshake")]
    HandshakeTimeout,

    #[error("unexpected daemon handshake: {0}")]
    Handshake(String),

    #[error("failed to spawn daemon process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to communicate with daemon: {0}")]
    Rpc(#[from] RpcError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_round_trips_the_port() {
        let line = first_line_for(Some(3500));
        assert_eq!(parse_first_line_port(&line), Some(3500));
        assert_eq!(parse_first_line_port(FIRST_LINE_NO_SERVER), None);
        assert_eq!(parse_first_line_port("garbage"), None);
    }

    #[test]
    fn launch_arguments_reproduce_parameters() {
        let mut params = DaemonLaunchParameters {
            storage_directory: Some(PathBuf::from("/tmp/storage")),
            port: Some(-1),
            acts_as_server: true,
            thread_factor: 4,
            acts_as_cluster: true,
            cluster_mirror_directory: Some(PathBuf::from("/tmp/mirror")),
            ..Default::default()
        };
        params
            .user_parameters
            .insert("build.flag".to_string(), "on".to_string());

        let args = launch_arguments(&params, &["127.0.0.1:3500".parse().unwrap()]);
        let joined = args.join(" ");
        assert!(joined.starts_with("daemon run"));
        assert!(joined.contains("--storage-directory /tmp/storage"));
        assert!(joined.contains("--server"));
        assert!(joined.contains("--port -1"));
        assert!(joined.contains("--thread-factor 4"));
        assert!(joined.contains("--cluster-enable"));
        assert!(joined.contains("--cluster-mirror-directory /tmp/mirror"));
        assert!(joined.contains("-U build.flag=on"));
        assert!(joined.contains("--connect-client 127.0.0.1:3500"));
    }
}
