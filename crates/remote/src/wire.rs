//! JSON shapes returned by the PCS REST endpoints.

use pcs_protocol::DirectoryEntry;
use serde::Deserialize;

/// Error envelope carried by failed PCS responses.
#[derive(Debug, Deserialize)]
pub(crate) struct PcsErrorBody {
    pub error_code: i64,
    #[serde(default)]
    pub error_msg: String,
}

/// A file object as reported by list/meta/rapidupload/createsuperfile.
#[derive(Debug, Deserialize)]
pub(crate) struct PcsFile {
    #[serde(default)]
    pub fs_id: u64,
    pub path: String,
    #[serde(default)]
    pub isdir: u8,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub md5: String,
}

impl From<PcsFile> for DirectoryEntry {
    fn from(f: PcsFile) -> Self {
        DirectoryEntry {
            fs_id: f.fs_id,
            path: pcs_protocol::path::normalize(&f.path),
            is_dir: f.isdir != 0,
            size: f.size,
            mtime: f.mtime,
            md5: f.md5,
            crc32: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PcsFileList {
    #[serde(default)]
    pub list: Vec<PcsFile>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PcsQuota {
    pub quota: u64,
    pub used: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PcsUserInfo {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub baidu_name: String,
    #[serde(default)]
    pub uk: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PcsTmpFile {
    pub md5: String,
}
