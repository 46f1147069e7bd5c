//! Netdisk request and report types.

use std::path::PathBuf;

use pcs_protocol::RapidUploadDigest;
use pcs_session::Account;
use pcs_transfer::{DownloadOutcome, TransferError, UploadOutcome};
use serde::Serialize;

/// One row of the account list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    /// Position used by [`switch_account_by_index`](crate::Netdisk::switch_account_by_index).
    pub index: usize,
    pub account: Account,
    pub active: bool,
}

/// Options for multi-target downloads.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Fetch everything without writing files.
    pub test: bool,
    /// Worker pool size override per file.
    pub parallel: Option<usize>,
}

/// What happened to one file of a multi-target download.
#[derive(Debug)]
pub enum DownloadReport {
    Downloaded(DownloadOutcome),
    /// A local file of that name exists and no resume record claims it.
    Skipped {
        remote_path: String,
        local_path: PathBuf,
    },
    Failed {
        remote_path: String,
        error: TransferError,
    },
}

impl DownloadReport {
    pub fn remote_path(&self) -> &str {
        match self {
            Self::Downloaded(o) => &o.remote_path,
            Self::Skipped { remote_path, .. } | Self::Failed { remote_path, .. } => remote_path,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// What happened to one file of a multi-source upload.
#[derive(Debug)]
pub struct UploadReport {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub result: Result<UploadOutcome, TransferError>,
}

/// Digest set of a local file plus the matching rapid-upload command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSum {
    pub digest: RapidUploadDigest,
    pub command: String,
}
