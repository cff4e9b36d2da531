//! Cluster worker tests: the outbound reconnect loop, registration
//! lifetimes and task invocation through the cluster invoker factory.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use uuid::Uuid;

use kiln::build::{
    DatabaseConfiguration, ExecutionContext, PathConfiguration, RepositoryConfiguration,
    ScriptConfiguration, TaskInvocationRequest, TaskInvokerInformation,
};
use kiln::config::DaemonLaunchParameters;
use kiln::daemon::invoker::mirror_directory_for_working_directory;
use kiln::daemon::{
    BackoffConfig, DaemonEnvironment, DaemonError, DefaultSocketFactory, RemoteDaemonConnection,
};
use kiln::rpc::{Request, ResponsePayload, RpcError};
use kiln::PathKey;

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Reserve a port that is currently free and not listened on.
fn reserve_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("reserve port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

fn test_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(100),
        step: Duration::from_millis(100),
        max: Duration::from_millis(400),
        reset: Duration::from_millis(50),
    }
}

fn worker_params(storage: &TempDir) -> DaemonLaunchParameters {
    DaemonLaunchParameters {
        storage_directory: Some(storage.path().to_path_buf()),
        port: None,
        acts_as_cluster: true,
        ..Default::default()
    }
}

fn start_coordinator(storage: &TempDir, port: u16) -> Arc<DaemonEnvironment> {
    let coordinator = DaemonEnvironment::new(DaemonLaunchParameters {
        storage_directory: Some(storage.path().to_path_buf()),
        port: Some(i32::from(port)),
        ..Default::default()
    });
    coordinator.start().expect("start coordinator");
    coordinator
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn cluster_addresses_require_acting_as_cluster() {
    let storage = TempDir::new().unwrap();
    let daemon = DaemonEnvironment::new(DaemonLaunchParameters {
        storage_directory: Some(storage.path().to_path_buf()),
        ..Default::default()
    });
    assert!(matches!(
        daemon.set_connect_to_as_cluster_addresses(vec![loopback(1)]),
        Err(DaemonError::Config(_))
    ));
}

#[test]
fn worker_registers_once_the_coordinator_becomes_reachable() {
    let coordinator_port = reserve_port();

    let worker_storage = TempDir::new().unwrap();
    let worker = DaemonEnvironment::new(worker_params(&worker_storage));
    worker.set_reconnect_backoff(test_backoff()).unwrap();
    worker
        .set_connect_to_as_cluster_addresses(vec![loopback(coordinator_port)])
        .unwrap();
    worker.start().expect("start worker");
    let worker_identifier = worker.environment_identifier().unwrap();

    // Let a few connect attempts fail while nothing listens.
    std::thread::sleep(Duration::from_millis(350));

    let coordinator_storage = TempDir::new().unwrap();
    let coordinator = start_coordinator(&coordinator_storage, coordinator_port);

    assert!(
        wait_until(Duration::from_secs(5), || {
            coordinator
                .client_cluster_task_invoker_factories()
                .iter()
                .any(|invoker| invoker.environment_identifier == worker_identifier)
        }),
        "worker never registered with the coordinator"
    );

    // Dropping the coordinator closes the connection; the worker goes back
    // to retrying. Closing the worker must terminate the retry loop quickly
    // even while it sleeps between attempts.
    coordinator.close();
    std::thread::sleep(Duration::from_millis(150));

    let closing = Instant::now();
    worker.close();
    assert!(
        closing.elapsed() < Duration::from_secs(2),
        "reconnectors did not terminate in a bounded time"
    );
}

#[test]
fn worker_registration_disappears_when_the_worker_closes() {
    let coordinator_port = reserve_port();
    let coordinator_storage = TempDir::new().unwrap();
    let coordinator = start_coordinator(&coordinator_storage, coordinator_port);

    let worker_storage = TempDir::new().unwrap();
    let worker = DaemonEnvironment::new(worker_params(&worker_storage));
    worker.set_reconnect_backoff(test_backoff()).unwrap();
    worker
        .set_connect_to_as_cluster_addresses(vec![loopback(coordinator_port)])
        .unwrap();
    worker.start().expect("start worker");

    assert!(
        wait_until(Duration::from_secs(5), || {
            !coordinator.client_cluster_task_invoker_factories().is_empty()
        }),
        "worker never registered"
    );

    worker.close();

    assert!(
        wait_until(Duration::from_secs(5), || {
            coordinator.client_cluster_task_invoker_factories().is_empty()
        }),
        "registration survived the worker connection"
    );

    coordinator.close();
}

#[test]
fn reconnector_stops_quickly_when_closed_mid_backoff() {
    let unreachable = reserve_port();
    let storage = TempDir::new().unwrap();
    let worker = DaemonEnvironment::new(worker_params(&storage));
    worker
        .set_reconnect_backoff(BackoffConfig {
            initial: Duration::from_secs(30),
            step: Duration::from_secs(30),
            max: Duration::from_secs(30),
            reset: Duration::from_secs(1),
        })
        .unwrap();
    worker
        .set_connect_to_as_cluster_addresses(vec![loopback(unreachable)])
        .unwrap();
    worker.start().expect("start worker");

    // The first dial is refused immediately, leaving the reconnector in its
    // 30-second sleep when close() cancels the token.
    std::thread::sleep(Duration::from_millis(200));
    let closing = Instant::now();
    worker.close();
    assert!(
        closing.elapsed() < Duration::from_secs(2),
        "close() waited out the backoff sleep"
    );
}

fn execution_context_for(working_directory: &PathKey) -> ExecutionContext {
    ExecutionContext {
        path_configuration: PathConfiguration {
            working_directory: working_directory.clone(),
        },
        repository_configuration: RepositoryConfiguration::default(),
        script_configuration: ScriptConfiguration::default(),
        database_configuration: DatabaseConfiguration::default(),
        user_parameters: Default::default(),
    }
}

#[test]
fn cluster_invocation_brackets_the_project_and_uses_the_mirror() {
    let storage = TempDir::new().unwrap();
    let mirror_base = TempDir::new().unwrap();
    let worker = DaemonEnvironment::new(DaemonLaunchParameters {
        storage_directory: Some(storage.path().to_path_buf()),
        port: Some(0),
        acts_as_cluster: true,
        cluster_mirror_directory: Some(mirror_base.path().to_path_buf()),
        ..Default::default()
    });
    worker.start().expect("start worker");
    let port = worker.server_socket_address().unwrap().unwrap().port();

    let working_directory = PathKey::new(Uuid::new_v4(), "/work/cluster-project");
    let connection = RemoteDaemonConnection::connect(&DefaultSocketFactory, loopback(port))
        .expect("connect");
    assert!(connection.cluster_task_invoker().is_some());

    let payload = connection
        .request(&Request::InvokeClusterTask {
            execution_context: execution_context_for(&working_directory),
            invoker_information: TaskInvokerInformation {
                coordinator_provider_key: Uuid::new_v4(),
                database_configuration: DatabaseConfiguration::default(),
            },
            requests: vec![
                TaskInvocationRequest {
                    task_id: "compile:main".to_string(),
                    parameters: Default::default(),
                },
                TaskInvocationRequest {
                    task_id: "test:unit".to_string(),
                    parameters: Default::default(),
                },
            ],
        })
        .expect("invoke cluster task");

    let worker_identifier = worker.environment_identifier().unwrap();
    match payload {
        ResponsePayload::Invoked(invoked) => {
            assert_eq!(invoked.results.len(), 2);
            assert!(invoked
                .results
                .iter()
                .all(|result| result.invoked_by == worker_identifier));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // The mirror subdirectory derived from the working directory was
    // created, and the execution bracket was fully closed.
    let mirror = mirror_directory_for_working_directory(mirror_base.path(), &working_directory);
    assert!(mirror.is_dir());
    let project = worker.get_project(working_directory).unwrap();
    assert_eq!(project.project().active_execution_count(), 0);

    connection.close();
    worker.close();
}

#[test]
fn cluster_start_failure_surfaces_to_the_coordinator() {
    let storage = TempDir::new().unwrap();
    let blocker = TempDir::new().unwrap();
    // The mirror base is a regular file, so creating the per-execution
    // mirror subdirectory must fail.
    let mirror_base = blocker.path().join("blocker");
    std::fs::write(&mirror_base, b"not a directory").unwrap();

    let worker = DaemonEnvironment::new(DaemonLaunchParameters {
        storage_directory: Some(storage.path().to_path_buf()),
        port: Some(0),
        acts_as_cluster: true,
        cluster_mirror_directory: Some(PathBuf::from(&mirror_base)),
        ..Default::default()
    });
    worker.start().expect("start worker");
    let port = worker.server_socket_address().unwrap().unwrap().port();

    let working_directory = PathKey::new(Uuid::new_v4(), "/work/failing-project");
    let connection = RemoteDaemonConnection::connect(&DefaultSocketFactory, loopback(port))
        .expect("connect");
    let result = connection.request(&Request::InvokeClusterTask {
        execution_context: execution_context_for(&working_directory),
        invoker_information: TaskInvokerInformation {
            coordinator_provider_key: Uuid::new_v4(),
            database_configuration: DatabaseConfiguration::default(),
        },
        requests: Vec::new(),
    });

    match result {
        Err(RpcError::Remote { code, .. }) => assert_eq!(code, "cluster_start_error"),
        other => panic!("expected a cluster start error, got {other:?}"),
    }

    connection.close();
    worker.close();
}
