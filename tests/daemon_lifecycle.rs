//! Daemon lifecycle integration tests: slot coordination, enumeration,
//! connection caching and the RPC surface, with multiple in-process daemons
//! sharing a storage directory.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use kiln::config::DaemonLaunchParameters;
use kiln::daemon::{
    DaemonEnvironment, DaemonError, DefaultSocketFactory, RemoteDaemonConnection,
    running_daemon_ports,
};
use kiln::rpc::{ProjectAction, Request, ResponsePayload};
use kiln::{DEFAULT_PORT, PathKey};

struct DaemonFixture {
    storage: TempDir,
}

impl DaemonFixture {
    fn new() -> Self {
        Self {
            storage: TempDir::new().expect("create storage dir"),
        }
    }

    fn params(&self, port: Option<i32>) -> DaemonLaunchParameters {
        DaemonLaunchParameters {
            storage_directory: Some(self.storage.path().to_path_buf()),
            port,
            ..Default::default()
        }
    }

    /// Start a daemon on an ephemeral port and return it with the port.
    fn start_server_daemon(&self) -> (Arc<DaemonEnvironment>, u16) {
        let daemon = DaemonEnvironment::new(self.params(Some(0)));
        daemon.start().expect("start daemon");
        let port = daemon
            .server_socket_address()
            .expect("started")
            .expect("has server")
            .port();
        (daemon, port)
    }

    fn ports(&self) -> Vec<u16> {
        let mut ports = running_daemon_ports(self.storage.path()).expect("enumerate");
        ports.sort_unstable();
        ports
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

#[test]
fn first_daemon_publishes_its_port_and_releases_on_close() {
    let fixture = DaemonFixture::new();
    let (daemon, port) = fixture.start_server_daemon();

    assert_eq!(fixture.ports(), vec![port]);

    let connection = RemoteDaemonConnection::connect(&DefaultSocketFactory, loopback(port))
        .expect("connect to daemon");
    let identifier = connection.environment_identifier();
    assert_ne!(identifier, Uuid::nil());
    assert_eq!(identifier, daemon.environment_identifier().unwrap());
    connection.close();

    daemon.close();
    assert_eq!(fixture.ports(), Vec::<u16>::new());
}

#[test]
fn default_port_parameters_resolve_to_the_default_port() {
    let fixture = DaemonFixture::new();
    let params = fixture.params(Some(-1));
    assert_eq!(params.effective_port(), Some(DEFAULT_PORT));
}

#[test]
fn second_daemon_on_the_same_port_fails_without_disturbing_the_first() {
    let fixture = DaemonFixture::new();
    let (first, port) = fixture.start_server_daemon();

    let second = DaemonEnvironment::new(fixture.params(Some(i32::from(port))));
    match second.start() {
        Err(DaemonError::Startup { .. }) => {}
        other => panic!("expected a startup error, got {other:?}"),
    }

    // The failed start released its slot; the original daemon's port is
    // still the only published one.
    assert_eq!(fixture.ports(), vec![port]);
    assert!(first.is_started());

    first.close();
}

#[test]
fn portless_daemon_uses_no_lock_file_but_can_dial_out() {
    let server_fixture = DaemonFixture::new();
    let (server, port) = server_fixture.start_server_daemon();

    let fixture = DaemonFixture::new();
    let portless = DaemonEnvironment::new(fixture.params(None));
    portless.start().expect("start portless daemon");

    assert_eq!(portless.server_socket_address().unwrap(), None);
    assert!(!fixture.storage.path().join(".lock.daemon").exists());
    assert_eq!(fixture.ports(), Vec::<u16>::new());

    let handle = portless.connect_to(loopback(port)).expect("dial out");
    assert_eq!(
        handle.environment_identifier(),
        server.environment_identifier().unwrap()
    );

    portless.close();
    server.close();
}

#[test]
fn lifecycle_state_is_monotonic() {
    let fixture = DaemonFixture::new();
    let daemon = DaemonEnvironment::new(fixture.params(None));

    // Non-lifecycle operations require STARTED.
    assert!(matches!(
        daemon.environment_identifier(),
        Err(DaemonError::NotStarted)
    ));
    assert!(matches!(
        daemon.connect_to(loopback(1)),
        Err(DaemonError::NotStarted)
    ));

    daemon.start().expect("start");
    assert!(matches!(daemon.start(), Err(DaemonError::AlreadyStarted)));

    daemon.close();
    // close is idempotent and the state never moves backwards.
    daemon.close();
    assert!(matches!(
        daemon.environment_identifier(),
        Err(DaemonError::Closed)
    ));
    assert!(matches!(daemon.start(), Err(DaemonError::Closed)));
}

#[test]
fn connection_handles_are_close_protected() {
    let server_fixture = DaemonFixture::new();
    let (server, port) = server_fixture.start_server_daemon();

    let fixture = DaemonFixture::new();
    let client = DaemonEnvironment::new(fixture.params(None));
    client.start().expect("start client daemon");

    let first = client.connect_to(loopback(port)).expect("first connect");
    let second = client.connect_to(loopback(port)).expect("second connect");

    // Closing the handles must not affect the shared cached connection.
    first.close();
    second.close();

    let third = client.connect_to(loopback(port)).expect("third connect");
    assert!(third.is_connected());
    assert_eq!(
        third.environment_identifier(),
        server.environment_identifier().unwrap()
    );
    third.launch_parameters().expect("shared connection still usable");

    client.close();
    server.close();
}

#[test]
fn closed_projects_are_replaced_on_next_lookup() {
    let fixture = DaemonFixture::new();
    let daemon = DaemonEnvironment::new(fixture.params(None));
    daemon.start().expect("start");

    let key = PathKey::new(Uuid::new_v4(), "/work/project");
    let first = daemon.get_project(key.clone()).expect("first project");
    let again = daemon.get_project(key.clone()).expect("same project");
    assert!(Arc::ptr_eq(first.project(), again.project()));

    first.close();
    assert!(first.is_closed());

    let fresh = daemon.get_project(key).expect("fresh project");
    assert!(!fresh.is_closed());
    assert!(!Arc::ptr_eq(first.project(), fresh.project()));

    daemon.close();
}

#[test]
fn rpc_surface_exposes_parameters_projects_and_invoker() {
    let fixture = DaemonFixture::new();
    let (daemon, port) = fixture.start_server_daemon();

    let connection = RemoteDaemonConnection::connect(&DefaultSocketFactory, loopback(port))
        .expect("connect");

    let launch = connection.launch_parameters().expect("launch parameters");
    assert_eq!(&launch, daemon.launch_parameters());

    let runtime = connection
        .runtime_configuration()
        .expect("runtime configuration");
    assert_eq!(runtime.port, Some(i32::from(port)));
    assert!(runtime.thread_factor >= 1);
    assert!(runtime.storage_directory.is_some());

    match connection.request(&Request::ExecutionInvoker).unwrap() {
        ResponsePayload::Invoker(payload) => assert_eq!(
            payload.execution_invoker.environment_identifier,
            daemon.environment_identifier().unwrap()
        ),
        other => panic!("unexpected payload: {other:?}"),
    }

    let working_directory = PathKey::new(Uuid::new_v4(), "/work/remote-project");
    match connection
        .request(&Request::Project {
            working_directory: working_directory.clone(),
            action: ProjectAction::Open,
        })
        .unwrap()
    {
        ResponsePayload::Project(payload) => {
            assert_eq!(payload.project.working_directory, working_directory);
            assert!(!payload.project.closed);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    connection.close();
    daemon.close();
}

#[test]
fn client_registrations_vanish_with_their_connection() {
    let fixture = DaemonFixture::new();
    let (daemon, port) = fixture.start_server_daemon();

    let worker_identifier = Uuid::new_v4();
    let connection = RemoteDaemonConnection::connect(&DefaultSocketFactory, loopback(port))
        .expect("connect");
    match connection
        .request(&Request::RegisterClusterInvoker {
            environment_identifier: worker_identifier,
        })
        .unwrap()
    {
        ResponsePayload::Registered(_) => {}
        other => panic!("unexpected payload: {other:?}"),
    }

    let invokers = daemon.client_cluster_task_invoker_factories();
    assert_eq!(invokers.len(), 1);
    assert_eq!(invokers[0].environment_identifier, worker_identifier);

    connection.close();
    // Deterministic cleanup runs from the close listener; give the handler
    // thread a moment to observe the shutdown.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while !daemon.client_cluster_task_invoker_factories().is_empty()
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert!(daemon.client_cluster_task_invoker_factories().is_empty());

    daemon.close();
}

#[test]
fn daemons_can_bridge_connections_for_clients() {
    let first_fixture = DaemonFixture::new();
    let (first, first_port) = first_fixture.start_server_daemon();
    let second_fixture = DaemonFixture::new();
    let (second, second_port) = second_fixture.start_server_daemon();

    // Ask the first daemon to connect to the second on our behalf.
    let connection = RemoteDaemonConnection::connect(&DefaultSocketFactory, loopback(first_port))
        .expect("connect");
    match connection
        .request(&Request::ConnectTo {
            address: loopback(second_port),
        })
        .unwrap()
    {
        ResponsePayload::Connected(payload) => {
            assert_eq!(
                payload.connected.remote_environment,
                second.environment_identifier().unwrap()
            );
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    connection.close();
    first.close();
    second.close();
}
