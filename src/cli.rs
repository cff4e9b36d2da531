//! Command line interface.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_PORT, DaemonLaunchParameters};
use crate::daemon::{
    DaemonEnvironment, DefaultSocketFactory, RemoteDaemonConnection, StartOutcome,
    launch::first_line_for, running_daemon_ports, start_daemon,
};

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Build daemon and cluster worker")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Daemon management.
    #[command(subcommand)]
    Daemon(DaemonCommand),
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Run a daemon in the foreground until a termination signal.
    Run(DaemonParams),

    /// Start a background daemon, or reuse a running one with the same
    /// parameters.
    Start(DaemonParams),

    /// Print the ports of running daemons for a storage directory.
    Ports {
        #[arg(long)]
        storage_directory: Option<PathBuf>,
    },

    /// Print the runtime configuration of a running daemon.
    Info {
        /// Daemon address; defaults to the default port on loopback.
        #[arg(long)]
        address: Option<SocketAddr>,
    },
}

#[derive(Args, Clone, Debug)]
struct DaemonParams {
    /// Storage directory of the build environment.
    #[arg(long)]
    storage_directory: Option<PathBuf>,

    /// Server port; a negative value selects the default port. Without this
    /// flag the daemon runs without an RPC server.
    #[arg(long, allow_hyphen_values = true)]
    port: Option<i32>,

    /// Bind all interfaces instead of loopback only.
    #[arg(long)]
    server: bool,

    /// Thread factor of the build environment; 0 lets the daemon choose.
    #[arg(long, default_value_t = 0)]
    thread_factor: u32,

    /// Offer task invocation capacity to cluster coordinators.
    #[arg(long = "cluster-enable")]
    cluster_enable: bool,

    /// Base directory for per-execution mirror subdirectories.
    #[arg(long)]
    cluster_mirror_directory: Option<PathBuf>,

    /// Environment user parameter as key=value; repeatable.
    #[arg(short = 'U', value_name = "KEY=VALUE", value_parser = parse_user_parameter)]
    user_parameter: Vec<(String, String)>,

    /// Coordinator address to dial as a cluster worker; repeatable.
    #[arg(long = "connect-client", value_name = "ADDRESS")]
    connect_client: Vec<SocketAddr>,
}

impl DaemonParams {
    fn to_launch_parameters(&self) -> DaemonLaunchParameters {
        let mut params = DaemonLaunchParameters {
            storage_directory: self.storage_directory.clone(),
            port: self.port,
            acts_as_server: self.server,
            thread_factor: self.thread_factor,
            acts_as_cluster: self.cluster_enable,
            cluster_mirror_directory: self.cluster_mirror_directory.clone(),
            ..Default::default()
        };
        for (key, value) in &self.user_parameter {
            params.user_parameters.insert(key.clone(), value.clone());
        }
        params
    }
}

fn parse_user_parameter(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {value:?}")),
    }
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> crate::Result<()> {
    match cli.command {
        CliCommand::Daemon(DaemonCommand::Run(params)) => run_daemon(&params),
        CliCommand::Daemon(DaemonCommand::Start(params)) => {
            let program = std::env::current_exe()?;
            match start_daemon(&program, &params.to_launch_parameters())? {
                StartOutcome::AlreadyRunning { port } => {
                    println!("daemon is already running with the same parameters (port {port})");
                }
                StartOutcome::Started { port } => {
                    println!("daemon started (port {port})");
                }
            }
            Ok(())
        }
        CliCommand::Daemon(DaemonCommand::Ports { storage_directory }) => {
            let storage = storage_directory.unwrap_or_else(crate::paths::default_storage_directory);
            for port in running_daemon_ports(&storage)? {
                println!("{port}");
            }
            Ok(())
        }
        CliCommand::Daemon(DaemonCommand::Info { address }) => {
            let address = address
                .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)));
            let connection = RemoteDaemonConnection::connect(&DefaultSocketFactory, address)
                .map_err(crate::error::Error::Rpc)?;
            let configuration = connection.runtime_configuration();
            let identifier = connection.environment_identifier();
            connection.close();
            let configuration = configuration.map_err(crate::error::Error::Rpc)?;
            print_configuration(address, identifier, &configuration);
            Ok(())
        }
    }
}

/// Run the daemon in the current process until SIGTERM/SIGINT.
fn run_daemon(params: &DaemonParams) -> crate::Result<()> {
    let launch_parameters = params.to_launch_parameters();
    let environment = DaemonEnvironment::new(launch_parameters);
    if !params.connect_client.is_empty() {
        environment.set_connect_to_as_cluster_addresses(params.connect_client.clone())?;
    }
    environment.start()?;

    // The first stdout line is the handshake a spawning parent waits for;
    // print it before anything else can appear on stdout.
    let port = environment
        .server_socket_address()?
        .map(|address| address.port());
    println!("{}", first_line_for(port));
    let _ = std::io::stdout().flush();

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutdown signal received");
    environment.close();
    Ok(())
}

fn print_configuration(address: SocketAddr, identifier: uuid::Uuid, configuration: &DaemonLaunchParameters) {
    println!("daemon at {address}");
    println!("  environment identifier: {identifier}");
    if let Some(storage) = &configuration.storage_directory {
        println!("  storage directory: {}", storage.display());
    }
    match configuration.port {
        Some(port) => println!("  port: {port}"),
        None => println!("  port: none"),
    }
    println!("  acts as server: {}", configuration.acts_as_server);
    println!("  acts as cluster: {}", configuration.acts_as_cluster);
    if let Some(mirror) = &configuration.cluster_mirror_directory {
        println!("  cluster mirror directory: {}", mirror.display());
    }
    println!("  thread factor: {}", configuration.thread_factor);
    for (key, value) in &configuration.user_parameters {
        println!("  user parameter: {key}={value}");
    }
}
