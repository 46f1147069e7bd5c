//! Netdisk error types.

use pcs_config::ConfigError;
use pcs_dircache::CacheError;
use pcs_remote::RemoteError;
use pcs_resolver::ResolveError;
use pcs_session::SessionError;
use pcs_transfer::TransferError;

/// Errors produced by [`Netdisk`](crate::Netdisk) operations.
#[derive(Debug, thiserror::Error)]
pub enum NetdiskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl NetdiskError {
    /// The remote error underneath, wherever it was wrapped.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Session(SessionError::Remote(e)) => Some(e),
            Self::Cache(CacheError::Remote(e)) => Some(e),
            Self::Resolve(ResolveError::Cache(CacheError::Remote(e))) => Some(e),
            Self::Transfer(e) => e.remote(),
            _ => None,
        }
    }

    /// Returns `true` when the credentials were rejected and the account
    /// needs to log in again.
    pub fn is_auth(&self) -> bool {
        self.remote().is_some_and(RemoteError::is_auth)
    }
}
