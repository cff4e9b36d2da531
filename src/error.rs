use thiserror::Error;

use crate::cache::CacheError;
use crate::daemon::{DaemonError, LaunchError, SlotLockError};
use crate::rpc::RpcError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors; match on the inner error for
/// anything beyond reporting.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    SlotLock(#[from] SlotLockError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
