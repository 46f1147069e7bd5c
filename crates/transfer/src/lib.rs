//! Chunked, concurrent, resumable transfers between the local filesystem
//! and the remote service.
//!
//! - [`digest`]: the MD5 / slice-MD5 / CRC-32 digest set used for rapid
//!   upload and download verification.
//! - [`DownloadEngine`]: range-fetches chunks through a bounded worker pool
//!   into a preallocated file, persisting a completion bitmap so an
//!   interrupted download resumes where it stopped.
//! - [`UploadEngine`]: tries rapid upload first, then uploads chunks
//!   concurrently and finalizes them remotely.

use std::sync::Arc;

use pcs_remote::RemoteError;

mod chunked;
pub mod digest;
mod download;
mod inflight;
mod progress;
mod resume;
mod retry;
mod types;
mod upload;
mod validation;

pub use chunked::{ChunkBitmap, ChunkPlan, ChunkReader, ChunkWriter};
pub use download::{DownloadEngine, DownloadOutcome, DownloadRequest};
pub use inflight::InflightRegistry;
pub use progress::{ProgressCallback, ProgressTracker, SpeedCalculator};
pub use resume::{RESUME_FORMAT_VERSION, ResumeRecord, ResumeStore};
pub use retry::RetryPolicy;
pub use types::{TransferSettings, TransferTask};
pub use upload::{UploadEngine, UploadOutcome, UploadRequest};
pub use validation::{local_target, validate_relative};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// The completion bitmap is persisted after this many chunks.
pub const PERSIST_EVERY: usize = 8;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("rapid upload miss for {0}")]
    RapidUploadMiss(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    /// The outcome of a transfer another caller started for the same pair.
    #[error(transparent)]
    Shared(Arc<TransferError>),
}

impl TransferError {
    /// Looks through [`Shared`](Self::Shared) wrappers.
    pub fn root(&self) -> &TransferError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// A copy for handing to other waiters. I/O and JSON errors keep their
    /// kind and message only.
    pub(crate) fn duplicate(&self) -> TransferError {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Remote(e) => Self::Remote(e.clone()),
            Self::Json(e) => Self::Json(serde::de::Error::custom(e.to_string())),
            Self::Integrity { expected, actual } => Self::Integrity {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::Cancelled => Self::Cancelled,
            Self::RapidUploadMiss(p) => Self::RapidUploadMiss(p.clone()),
            Self::NotAFile(p) => Self::NotAFile(p.clone()),
            Self::InvalidPath(p) => Self::InvalidPath(p.clone()),
            Self::Worker(m) => Self::Worker(m.clone()),
            Self::Shared(inner) => Self::Shared(Arc::clone(inner)),
        }
    }

    /// The remote error at the root, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self.root() {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Worker(e.to_string())
    }
}
