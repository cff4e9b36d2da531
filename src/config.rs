//! Daemon launch configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port used when the configured port is negative ("use default").
pub const DEFAULT_PORT: u16 = 3500;

/// Name of the optional per-storage-directory configuration file.
const CONFIG_FILE_NAME: &str = "daemon.toml";

/// Immutable launch configuration of a daemon instance.
///
/// Constructed before `start()` and compared structurally when probing for an
/// already-running daemon with the same configuration. The daemon finalizes a
/// second instance of this type (the runtime configuration) during startup,
/// with the storage directory, thread factor and port replaced by their
/// resolved values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonLaunchParameters {
    /// Storage directory of the build environment. `None` uses the default.
    pub storage_directory: Option<PathBuf>,
    /// Server port. `None` runs without an RPC server; a negative value
    /// selects [`DEFAULT_PORT`].
    pub port: Option<i32>,
    /// Bind to all interfaces instead of loopback only.
    pub acts_as_server: bool,
    /// Thread factor for the build environment. `0` means "choose".
    pub thread_factor: u32,
    /// Whether this daemon offers task invocation capacity to coordinators.
    pub acts_as_cluster: bool,
    /// Base directory for per-execution mirror subdirectories.
    pub cluster_mirror_directory: Option<PathBuf>,
    /// Free-form environment user parameters, ordered.
    pub user_parameters: BTreeMap<String, String>,
    /// Idle shutdown delay. Accepted and surfaced in the runtime
    /// configuration, but no shutdown policy is currently attached to it.
    pub idle_shutdown_ms: Option<u64>,
}

impl Default for DaemonLaunchParameters {
    fn default() -> Self {
        Self {
            storage_directory: None,
            port: None,
            acts_as_server: false,
            thread_factor: 0,
            acts_as_cluster: false,
            cluster_mirror_directory: None,
            user_parameters: BTreeMap::new(),
            idle_shutdown_ms: None,
        }
    }
}

impl DaemonLaunchParameters {
    /// The port the server should bind, or `None` when no server is
    /// configured.
    pub fn effective_port(&self) -> Option<u16> {
        match self.port {
            None => None,
            Some(p) if p < 0 => Some(DEFAULT_PORT),
            Some(p) => Some(p as u16),
        }
    }

    /// Reject parameter combinations that cannot be started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(port) = self.port
            && port > u16::MAX as i32
        {
            return Err(ConfigError::PortOutOfRange { port });
        }
        if self.cluster_mirror_directory.is_some() && !self.acts_as_cluster {
            return Err(ConfigError::MirrorWithoutCluster);
        }
        Ok(())
    }
}

/// Optional `daemon.toml` in the storage directory; supplies defaults the
/// command line did not set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub thread_factor: Option<u32>,
    pub idle_shutdown_ms: Option<u64>,
    pub user_parameters: BTreeMap<String, String>,
}

impl StorageConfig {
    /// Load the configuration file from `storage_dir`, if present.
    pub fn load(storage_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = storage_dir.join(CONFIG_FILE_NAME);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ConfigError::Read { path, source: err }),
        };
        let config =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(Some(config))
    }

    /// Fill unset fields of `params` from this file configuration.
    pub fn apply_defaults(&self, params: &mut DaemonLaunchParameters) {
        if params.thread_factor == 0
            && let Some(factor) = self.thread_factor
        {
            params.thread_factor = factor;
        }
        if params.idle_shutdown_ms.is_none() {
            params.idle_shutdown_ms = self.idle_shutdown_ms;
        }
        for (key, value) in &self.user_parameters {
            params
                .user_parameters
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("port {port} is out of range")]
    PortOutOfRange { port: i32 },

    #[error("cluster mirror directory requires acting as cluster")]
    MirrorWithoutCluster,

    #[error("cluster addresses require acting as cluster")]
    ClusterAddressesWithoutCluster,

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_port_selects_default() {
        let params = DaemonLaunchParameters {
            port: Some(-1),
            ..Default::default()
        };
        assert_eq!(params.effective_port(), Some(DEFAULT_PORT));
    }

    #[test]
    fn absent_port_means_no_server() {
        assert_eq!(DaemonLaunchParameters::default().effective_port(), None);
    }

    #[test]
    fn mirror_directory_requires_cluster() {
        let params = DaemonLaunchParameters {
            cluster_mirror_directory: Some(PathBuf::from("/tmp/mirror")),
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::MirrorWithoutCluster)
        ));
    }

    #[test]
    fn storage_config_fills_only_unset_fields() {
        let mut params = DaemonLaunchParameters {
            thread_factor: 4,
            ..Default::default()
        };
        params
            .user_parameters
            .insert("cli.key".into(), "cli".into());

        let mut file = StorageConfig::default();
        file.thread_factor = Some(8);
        file.idle_shutdown_ms = Some(60_000);
        file.user_parameters.insert("cli.key".into(), "file".into());
        file.user_parameters.insert("file.key".into(), "file".into());

        file.apply_defaults(&mut params);
        assert_eq!(params.thread_factor, 4);
        assert_eq!(params.idle_shutdown_ms, Some(60_000));
        assert_eq!(params.user_parameters["cli.key"], "cli");
        assert_eq!(params.user_parameters["file.key"], "file");
    }

    #[test]
    fn launch_parameters_equality_is_structural() {
        let mut a = DaemonLaunchParameters::default();
        let mut b = DaemonLaunchParameters::default();
        a.user_parameters.insert("k".into(), "v".into());
        b.user_parameters.insert("k".into(), "v".into());
        assert_eq!(a, b);
        b.port = Some(-1);
        assert_ne!(a, b);
    }
}
