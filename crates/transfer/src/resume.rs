//! Download resume records.
//!
//! One JSON file per (remote path, local path) pair, named by the SHA-256
//! of the pair. A record is only reused when its version, size, chunk size
//! and target MD5 all match the transfer being started.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::TransferError;
use crate::chunked::{ChunkBitmap, ChunkPlan};

/// Current on-disk record format.
pub const RESUME_FORMAT_VERSION: u32 = 1;

/// Persisted state of an interrupted download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub version: u32,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub chunk_size: u64,
    #[serde(default)]
    pub md5: String,
    pub bitmap: ChunkBitmap,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    /// A fresh record with nothing transferred.
    pub fn new(remote_path: &str, local_path: &Path, plan: &ChunkPlan, md5: &str) -> Self {
        Self {
            version: RESUME_FORMAT_VERSION,
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            size: plan.size(),
            chunk_size: plan.chunk_size(),
            md5: md5.to_string(),
            bitmap: ChunkBitmap::new(plan.count()),
            updated_at: Utc::now(),
        }
    }

    /// Returns `true` if this record describes the transfer `plan`/`md5`
    /// and still has work left.
    pub fn matches(&self, plan: &ChunkPlan, md5: &str) -> bool {
        self.version == RESUME_FORMAT_VERSION
            && self.size == plan.size()
            && self.chunk_size == plan.chunk_size()
            && self.md5.eq_ignore_ascii_case(md5)
            && self.bitmap.len() == plan.count()
            && !self.bitmap.is_complete()
    }
}

/// Directory of resume records.
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Record key for a (remote, local) pair.
    pub fn key(remote_path: &str, local_path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(remote_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(local_path.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn record_path(&self, remote_path: &str, local_path: &Path) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::key(remote_path, local_path)))
    }

    /// Loads the record for a pair. Unreadable records are discarded.
    pub async fn load(&self, remote_path: &str, local_path: &Path) -> Option<ResumeRecord> {
        let path = self.record_path(remote_path, local_path);
        let data = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<ResumeRecord>(&data) {
            Ok(record) if record.remote_path == remote_path && record.local_path == local_path => {
                debug!(remote = remote_path, done = record.bitmap.count_set(), "resume record loaded");
                Some(record)
            }
            Ok(_) => {
                warn!(path = %path.display(), "resume record belongs to another transfer, discarding");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt resume record, discarding");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    /// Writes a record through a temp file and rename.
    pub async fn save(&self, record: &ResumeRecord) -> Result<(), TransferError> {
        let path = self.record_path(&record.remote_path, &record.local_path);
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Deletes the record for a pair, if any.
    pub async fn remove(&self, remote_path: &str, local_path: &Path) -> Result<(), TransferError> {
        match tokio::fs::remove_file(self.record_path(remote_path, local_path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `true` if a record exists for the pair.
    pub async fn exists(&self, remote_path: &str, local_path: &Path) -> bool {
        tokio::fs::try_exists(self.record_path(remote_path, local_path))
            .await
            .unwrap_or(false)
    }
}
