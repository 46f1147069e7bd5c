use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Instant;

use pcs_config::PcsConfig;
use pcs_protocol::{TransferKind, TransferProgress, TransferStatus};

use crate::RetryPolicy;
use crate::chunked::{ChunkBitmap, ChunkPlan};
use crate::progress::SpeedCalculator;

/// Tunables shared by both engines.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Default worker pool size.
    pub max_parallel: usize,
    pub retry: RetryPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_parallel: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransferSettings {
    pub fn from_config(config: &PcsConfig) -> Self {
        Self {
            chunk_size: config.chunk_size(),
            max_parallel: config.max_parallel.max(1),
            retry: RetryPolicy::default(),
        }
    }

    /// Pool size for one transfer: the override if given, never below 1.
    pub fn workers(&self, parallel: Option<usize>) -> usize {
        parallel.unwrap_or(self.max_parallel).max(1)
    }
}

/// One download or upload (thread-safe).
pub struct TransferTask {
    inner: RwLock<TaskInner>,
    speed: SpeedCalculator,
}

struct TaskInner {
    id: String,
    kind: TransferKind,
    status: TransferStatus,
    remote_path: String,
    local_path: PathBuf,
    plan: ChunkPlan,
    bitmap: ChunkBitmap,
    transferred_bytes: u64,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: String,
}

impl TransferTask {
    /// Creates a pending task with an all-zero bitmap.
    pub fn new(kind: TransferKind, remote_path: &str, local_path: &Path, plan: ChunkPlan) -> Self {
        Self {
            inner: RwLock::new(TaskInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                status: TransferStatus::Pending,
                remote_path: remote_path.to_string(),
                local_path: local_path.to_path_buf(),
                plan,
                bitmap: ChunkBitmap::new(plan.count()),
                transferred_bytes: 0,
                started_at: None,
                finished_at: None,
                error: String::new(),
            }),
            speed: SpeedCalculator::new(None, None),
        }
    }

    /// Seeds completion state from a resume record.
    pub fn restore(&self, bitmap: ChunkBitmap) {
        let mut s = self.inner.write().unwrap();
        s.transferred_bytes = bitmap.bytes_done(&s.plan);
        s.bitmap = bitmap;
    }

    /// Marks the task as running.
    pub fn start(&self) {
        let mut s = self.inner.write().unwrap();
        s.status = TransferStatus::Running;
        s.started_at = Some(Instant::now());
    }

    /// Records chunk `index` as fully transferred. Returns `false` if it
    /// already was.
    pub fn complete_chunk(&self, index: usize) -> bool {
        let bytes = {
            let mut s = self.inner.write().unwrap();
            if !s.bitmap.set(index) {
                return false;
            }
            let bytes = s.plan.range(index).len();
            s.transferred_bytes += bytes;
            bytes
        };
        self.speed.add_sample(bytes);
        true
    }

    /// Marks the task as completed.
    pub fn complete(&self) {
        self.finish(TransferStatus::Completed, "");
    }

    /// Marks the task as paused; completed chunks stay recorded.
    pub fn pause(&self) {
        self.finish(TransferStatus::Paused, "");
    }

    /// Marks the task as failed with an error message.
    pub fn fail(&self, err: &str) {
        self.finish(TransferStatus::Failed, err);
    }

    fn finish(&self, status: TransferStatus, err: &str) {
        let mut s = self.inner.write().unwrap();
        s.status = status;
        s.error = err.to_string();
        s.finished_at = Some(Instant::now());
    }

    /// Returns a snapshot of the completion bitmap.
    pub fn bitmap(&self) -> ChunkBitmap {
        self.inner.read().unwrap().bitmap.clone()
    }

    /// Returns current progress as a protocol-compatible struct.
    pub fn progress(&self) -> TransferProgress {
        let s = self.inner.read().unwrap();
        let remaining = s.plan.size().saturating_sub(s.transferred_bytes);
        let eta_secs = if s.status == TransferStatus::Running {
            self.speed.eta(remaining).map(|d| d.as_secs_f64())
        } else {
            None
        };
        TransferProgress {
            task_id: s.id.clone(),
            kind: s.kind,
            status: s.status,
            remote_path: s.remote_path.clone(),
            local_path: s.local_path.display().to_string(),
            total_bytes: s.plan.size(),
            transferred_bytes: s.transferred_bytes,
            chunks_done: s.bitmap.count_set(),
            chunks_total: s.bitmap.len(),
            bytes_per_second: self.speed.bytes_per_second(),
            eta_secs,
            error: s.error.clone(),
        }
    }

    /// Returns `true` if the task is pending or running.
    pub fn is_active(&self) -> bool {
        let s = self.inner.read().unwrap();
        matches!(s.status, TransferStatus::Pending | TransferStatus::Running)
    }

    pub fn id(&self) -> String {
        self.inner.read().unwrap().id.clone()
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.read().unwrap().status
    }

    pub fn kind(&self) -> TransferKind {
        self.inner.read().unwrap().kind
    }

    /// Wall time between start and finish, if both happened.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let s = self.inner.read().unwrap();
        Some(s.finished_at?.duration_since(s.started_at?))
    }
}
