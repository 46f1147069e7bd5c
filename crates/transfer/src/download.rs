//! Chunked, concurrent, resumable downloads.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use pcs_protocol::{AuthTriplet, DirectoryEntry, TransferKind, TransferStatus, path};
use pcs_remote::{RemoteError, RemoteService};
use pcs_session::SessionContext;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::{ChunkBitmap, ChunkPlan, ChunkWriter};
use crate::digest::md5_file;
use crate::inflight::InflightRegistry;
use crate::progress::ProgressTracker;
use crate::resume::{ResumeRecord, ResumeStore};
use crate::types::{TransferSettings, TransferTask};
use crate::{PERSIST_EVERY, RetryPolicy, TransferError};

/// One remote file to fetch.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Fetch every chunk but never open the destination.
    pub test_mode: bool,
    /// Worker pool size override.
    pub parallel: Option<usize>,
}

impl DownloadRequest {
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            test_mode: false,
            parallel: None,
        }
    }
}

/// How a download ended. `Paused` means it was cancelled and can resume.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub status: TransferStatus,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    /// Chunks fetched by this run.
    pub chunks_fetched: usize,
    pub chunks_total: usize,
    /// Whether a resume record was picked up.
    pub resumed: bool,
    pub bitmap: ChunkBitmap,
}

/// Fetches remote files through a bounded worker pool per transfer.
pub struct DownloadEngine {
    remote: Arc<dyn RemoteService>,
    resume: Arc<ResumeStore>,
    inflight: InflightRegistry<DownloadOutcome>,
    settings: TransferSettings,
    tracker: Option<Arc<ProgressTracker>>,
}

impl DownloadEngine {
    pub fn new(remote: Arc<dyn RemoteService>, resume: ResumeStore, settings: TransferSettings) -> Self {
        Self {
            remote,
            resume: Arc::new(resume),
            inflight: InflightRegistry::new(),
            settings,
            tracker: None,
        }
    }

    /// Reports every task to `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn resume_store(&self) -> &ResumeStore {
        &self.resume
    }

    /// Downloads `req.remote_path` to `req.local_path`.
    ///
    /// A second call for the same pair while one runs waits for it and
    /// returns its outcome. Cancelling `cancel` pauses the transfer: chunks
    /// already written stay recorded and a later call resumes from them.
    pub async fn download(
        &self,
        ctx: &SessionContext,
        req: DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, TransferError> {
        let remote_path = path::normalize(&req.remote_path);
        let mut key = ResumeStore::key(&remote_path, &req.local_path);
        if req.test_mode {
            key.insert_str(0, "test:");
        }
        self.inflight
            .run(&key, || self.run(ctx, &remote_path, &req, cancel))
            .await
    }

    async fn run(
        &self,
        ctx: &SessionContext,
        remote_path: &str,
        req: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, TransferError> {
        let remote = &self.remote;
        let auth = &ctx.auth;
        let meta: DirectoryEntry = self
            .settings
            .retry
            .run("metadata", cancel, move || remote.metadata(auth, remote_path))
            .await?;
        if meta.is_dir {
            return Err(TransferError::NotAFile(remote_path.to_string()));
        }

        let plan = ChunkPlan::new(meta.size, self.settings.chunk_size);
        let task = Arc::new(TransferTask::new(
            TransferKind::Download,
            remote_path,
            &req.local_path,
            plan,
        ));

        let (persister, resumed) = if req.test_mode {
            (None, false)
        } else {
            let (record, resumed) = self
                .prepare_destination(remote_path, &req.local_path, &plan, &meta.md5)
                .await?;
            task.restore(record.bitmap.clone());
            let persister = Persister {
                store: Arc::clone(&self.resume),
                record: tokio::sync::Mutex::new(record),
            };
            (Some(Arc::new(persister)), resumed)
        };

        if let Some(tracker) = &self.tracker {
            tracker.track(Arc::clone(&task));
        }
        let result = self
            .fetch_all(ctx, remote_path, req, &plan, &meta, &task, persister, resumed, cancel)
            .await;

        match &result {
            Ok(outcome) if outcome.status == TransferStatus::Paused => task.pause(),
            Ok(_) => task.complete(),
            Err(e) => task.fail(&e.to_string()),
        }
        if let Some(tracker) = &self.tracker {
            tracker.finish(&task.id());
        }
        match &result {
            Ok(outcome) => info!(
                remote = remote_path,
                status = ?outcome.status,
                fetched = outcome.chunks_fetched,
                total = outcome.chunks_total,
                "download finished"
            ),
            Err(e) => warn!(remote = remote_path, error = %e, "download failed"),
        }
        result
    }

    /// Sizes the destination and returns the resume record to work from,
    /// plus whether it was an existing one.
    async fn prepare_destination(
        &self,
        remote_path: &str,
        local_path: &Path,
        plan: &ChunkPlan,
        md5: &str,
    ) -> Result<(ResumeRecord, bool), TransferError> {
        let existing_len = tokio::fs::metadata(local_path).await.ok().map(|m| m.len());
        if let Some(record) = self.resume.load(remote_path, local_path).await {
            if record.matches(plan, md5) && existing_len == Some(plan.size()) {
                ChunkWriter::create(local_path, plan.size(), true).await?;
                info!(
                    remote = remote_path,
                    done = record.bitmap.count_set(),
                    total = plan.count(),
                    "resuming download"
                );
                return Ok((record, true));
            }
            debug!(remote = remote_path, "stale resume record, starting over");
        }

        // The record goes first: a preallocated file must never exist
        // without one claiming it.
        let record = ResumeRecord::new(remote_path, local_path, plan, md5);
        self.resume.save(&record).await?;
        ChunkWriter::create(local_path, plan.size(), false).await?;
        Ok((record, false))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_all(
        &self,
        ctx: &SessionContext,
        remote_path: &str,
        req: &DownloadRequest,
        plan: &ChunkPlan,
        meta: &DirectoryEntry,
        task: &Arc<TransferTask>,
        persister: Option<Arc<Persister>>,
        resumed: bool,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, TransferError> {
        let missing: VecDeque<usize> = task.bitmap().missing().into();
        let workers = self.settings.workers(req.parallel).min(missing.len());
        info!(
            remote = remote_path,
            size = plan.size(),
            chunks = plan.count(),
            missing = missing.len(),
            workers,
            "download started"
        );
        task.start();

        let stop = cancel.child_token();
        let shared = Arc::new(WorkerShared {
            remote: Arc::clone(&self.remote),
            auth: ctx.auth.clone(),
            remote_path: remote_path.to_string(),
            destination: (!req.test_mode).then(|| req.local_path.clone()),
            plan: *plan,
            queue: Mutex::new(missing),
            task: Arc::clone(task),
            persister: persister.clone(),
            completed: AtomicUsize::new(0),
            retry: self.settings.retry.clone(),
            stop: stop.clone(),
        });

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(worker(Arc::clone(&shared)));
        }

        let mut fetched = 0;
        let mut first_err: Option<TransferError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(n)) => fetched += n,
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    stop.cancel();
                    first_err.get_or_insert(e.into());
                }
            }
        }

        // The pool has drained; record exactly what reached the file.
        if let Some(p) = &persister {
            if let Err(e) = p.save(task).await {
                if first_err.is_none() {
                    return Err(e);
                }
                warn!(remote = remote_path, error = %e, "could not persist resume record");
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        let bitmap = task.bitmap();
        let mut outcome = DownloadOutcome {
            status: TransferStatus::Completed,
            remote_path: remote_path.to_string(),
            local_path: req.local_path.clone(),
            size: plan.size(),
            chunks_fetched: fetched,
            chunks_total: plan.count(),
            resumed,
            bitmap: bitmap.clone(),
        };
        if !bitmap.is_complete() {
            outcome.status = TransferStatus::Paused;
            return Ok(outcome);
        }

        if !req.test_mode {
            verify(&req.local_path, meta).await?;
            self.resume.remove(remote_path, &req.local_path).await?;
        }
        Ok(outcome)
    }
}

/// Checks the reassembled file against the remote digest, or against the
/// remote size when no digest is known.
async fn verify(local_path: &Path, meta: &DirectoryEntry) -> Result<(), TransferError> {
    ChunkWriter::open(local_path).await?.sync().await?;

    if meta.md5.is_empty() {
        let len = tokio::fs::metadata(local_path).await?.len();
        if len != meta.size {
            return Err(TransferError::Integrity {
                expected: format!("{} bytes", meta.size),
                actual: format!("{len} bytes"),
            });
        }
        return Ok(());
    }

    let actual = md5_file(local_path).await?;
    if !actual.eq_ignore_ascii_case(&meta.md5) {
        return Err(TransferError::Integrity {
            expected: meta.md5.to_lowercase(),
            actual,
        });
    }
    debug!(path = %local_path.display(), md5 = %actual, "download verified");
    Ok(())
}

/// The persisted copy of a task's bitmap.
struct Persister {
    store: Arc<ResumeStore>,
    record: tokio::sync::Mutex<ResumeRecord>,
}

impl Persister {
    async fn save(&self, task: &TransferTask) -> Result<(), TransferError> {
        let mut record = self.record.lock().await;
        // Snapshot under the lock so saves never go backwards.
        record.bitmap = task.bitmap();
        record.updated_at = Utc::now();
        self.store.save(&record).await?;
        debug!(
            remote = %record.remote_path,
            done = record.bitmap.count_set(),
            "resume record persisted"
        );
        Ok(())
    }
}

struct WorkerShared {
    remote: Arc<dyn RemoteService>,
    auth: AuthTriplet,
    remote_path: String,
    destination: Option<PathBuf>,
    plan: ChunkPlan,
    queue: Mutex<VecDeque<usize>>,
    task: Arc<TransferTask>,
    persister: Option<Arc<Persister>>,
    completed: AtomicUsize,
    retry: RetryPolicy,
    stop: CancellationToken,
}

impl WorkerShared {
    fn next_chunk(&self) -> Option<usize> {
        if self.stop.is_cancelled() {
            return None;
        }
        self.queue.lock().unwrap().pop_front()
    }

    async fn fetch(&self, index: usize) -> Result<Vec<u8>, TransferError> {
        let range = self.plan.range(index);
        let remote = &self.remote;
        let auth = &self.auth;
        let p = self.remote_path.as_str();
        self.retry
            .run("range fetch", &self.stop, move || async move {
                let data = remote.download_range(auth, p, range).await?;
                if data.len() as u64 != range.len() {
                    return Err(RemoteError::Transient(format!(
                        "short read for bytes {}-{}: got {}",
                        range.start,
                        range.end,
                        data.len()
                    )));
                }
                Ok(data)
            })
            .await
    }
}

/// Claims chunks until the queue drains or the pool is stopped. Returns the
/// number of chunks this worker fetched.
async fn worker(shared: Arc<WorkerShared>) -> Result<usize, TransferError> {
    let result = run_worker(&shared).await;
    if result.is_err() {
        shared.stop.cancel();
    }
    result
}

async fn run_worker(shared: &WorkerShared) -> Result<usize, TransferError> {
    let mut writer = match &shared.destination {
        Some(p) => Some(ChunkWriter::open(p).await?),
        None => None,
    };
    let mut fetched = 0;

    while let Some(index) = shared.next_chunk() {
        let data = match shared.fetch(index).await {
            Ok(data) => data,
            Err(TransferError::Cancelled) => break,
            Err(e) => return Err(e),
        };
        if let Some(w) = writer.as_mut() {
            w.write_at(shared.plan.range(index).start, &data).await?;
        }
        if !shared.task.complete_chunk(index) {
            continue;
        }
        fetched += 1;

        let done = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if done % PERSIST_EVERY == 0 {
            if let Some(p) = &shared.persister {
                p.save(&shared.task).await?;
            }
        }
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::md5_hex;
    use pcs_remote::memory::MemoryRemote;
    use std::time::Duration;
    use tempfile::TempDir;

    const KIB: usize = 1024;

    struct Fixture {
        remote: Arc<MemoryRemote>,
        ctx: SessionContext,
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let remote = Arc::new(MemoryRemote::new());
            remote.register_account("token", 7, "alice");
            Self {
                remote,
                ctx: SessionContext {
                    uid: 7,
                    name: "alice".into(),
                    auth: AuthTriplet::new("token", "", ""),
                    workdir: "/".into(),
                },
                dir: TempDir::new().unwrap(),
            }
        }

        fn engine(&self, chunk_size: u64, max_parallel: usize) -> DownloadEngine {
            DownloadEngine::new(
                Arc::clone(&self.remote) as Arc<dyn RemoteService>,
                ResumeStore::new(self.dir.path().join("resume")),
                TransferSettings {
                    chunk_size,
                    max_parallel,
                    retry: RetryPolicy::immediate(3),
                },
            )
        }

        fn local(&self, name: &str) -> PathBuf {
            self.dir.path().join("save").join(name)
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn six_hundred_kib_in_three_chunks() {
        let fx = Fixture::new();
        let data = pattern(600 * KIB);
        fx.remote.put_file(7, "/big.bin", &data);
        let engine = fx.engine(256 * KIB as u64, 4);
        let local = fx.local("big.bin");

        let outcome = engine
            .download(&fx.ctx, DownloadRequest::new("/big.bin", &local), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(outcome.chunks_total, 3);
        assert_eq!(outcome.chunks_fetched, 3);
        assert_eq!(outcome.bitmap.to_vec(), vec![1, 1, 1]);
        assert_eq!(fx.remote.range_requests(), 3);
        assert_eq!(md5_hex(&std::fs::read(&local).unwrap()), md5_hex(&data));
        assert!(!engine.resume_store().exists("/big.bin", &local).await);
    }

    #[tokio::test]
    async fn reassembles_for_even_and_uneven_chunking() {
        for (size, chunk) in [(4096usize, 1024u64), (4097, 1024), (1000, 4096), (0, 512)] {
            let fx = Fixture::new();
            let data = pattern(size);
            fx.remote.put_file(7, "/f", &data);
            let local = fx.local("f");
            fx.engine(chunk, 3)
                .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(std::fs::read(&local).unwrap(), data, "size {size} chunk {chunk}");
        }
    }

    #[tokio::test]
    async fn transient_range_failures_are_retried() {
        let fx = Fixture::new();
        let data = pattern(5 * KIB);
        fx.remote.put_file(7, "/f", &data);
        fx.remote.fail_next_ranges(2);
        let local = fx.local("f");

        let outcome = fx
            .engine(KIB as u64, 1)
            .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(fx.remote.range_requests(), 5 + 2);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn interrupted_download_resumes_remaining_chunks() {
        let fx = Fixture::new();
        let data = pattern(10 * KIB + 100);
        fx.remote.put_file(7, "/f", &data);
        let engine = fx.engine(KIB as u64, 1);
        let local = fx.local("f");

        fx.remote.fail_ranges_after(Some(4));
        let err = engine
            .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.remote(), Some(RemoteError::Api { code: 31326, .. })));

        let record = engine.resume_store().load("/f", &local).await.unwrap();
        assert_eq!(record.bitmap.count_set(), 4);
        assert_eq!(record.bitmap.missing(), (4..11).collect::<Vec<_>>());

        fx.remote.fail_ranges_after(None);
        let before = fx.remote.range_requests();
        let outcome = engine
            .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.resumed);
        assert_eq!(outcome.chunks_fetched, 7);
        assert_eq!(fx.remote.range_requests() - before, 7);
        assert_eq!(std::fs::read(&local).unwrap(), data);
        assert!(!engine.resume_store().exists("/f", &local).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_pauses_and_keeps_progress() {
        let fx = Fixture::new();
        let data = pattern(8 * KIB);
        fx.remote.put_file(7, "/f", &data);
        fx.remote.set_range_delay(Some(Duration::from_millis(100)));
        let engine = fx.engine(KIB as u64, 1);
        let local = fx.local("f");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });
        let paused = engine
            .download(&fx.ctx, DownloadRequest::new("/f", &local), &cancel)
            .await
            .unwrap();
        assert_eq!(paused.status, TransferStatus::Paused);
        assert!(paused.chunks_fetched >= 1 && paused.chunks_fetched < 8);

        let record = engine.resume_store().load("/f", &local).await.unwrap();
        assert_eq!(record.bitmap.count_set(), paused.chunks_fetched);

        fx.remote.set_range_delay(None);
        let done = engine
            .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(done.chunks_fetched, 8 - paused.chunks_fetched);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn replaced_remote_file_discards_stale_record() {
        let fx = Fixture::new();
        fx.remote.put_file(7, "/f", &pattern(4 * KIB));
        let engine = fx.engine(KIB as u64, 1);
        let local = fx.local("f");

        fx.remote.fail_ranges_after(Some(2));
        assert!(
            engine
                .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
                .await
                .is_err()
        );
        fx.remote.fail_ranges_after(None);

        let replacement = b"entirely different content".to_vec();
        fx.remote.put_file(7, "/f", &replacement);
        let outcome = engine
            .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.resumed);
        assert_eq!(std::fs::read(&local).unwrap(), replacement);
    }

    #[tokio::test]
    async fn digest_mismatch_fails_and_keeps_partial_file() {
        let fx = Fixture::new();
        fx.remote.put_file(7, "/f", &pattern(3 * KIB));
        fx.remote
            .override_reported_md5(7, "/f", "00000000000000000000000000000000");
        let local = fx.local("f");

        let err = fx
            .engine(KIB as u64, 2)
            .download(&fx.ctx, DownloadRequest::new("/f", &local), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));
        assert!(local.exists());
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let fx = Fixture::new();
        fx.remote.put_file(7, "/dir/inner", b"x");
        let err = fx
            .engine(KIB as u64, 2)
            .download(&fx.ctx, DownloadRequest::new("/dir", fx.local("dir")), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotAFile(_)));
    }

    #[tokio::test]
    async fn test_mode_fetches_without_writing() {
        let fx = Fixture::new();
        fx.remote.put_file(7, "/f", &pattern(3 * KIB));
        let engine = fx.engine(KIB as u64, 2);
        let local = fx.local("f");

        let mut req = DownloadRequest::new("/f", &local);
        req.test_mode = true;
        let outcome = engine.download(&fx.ctx, req, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, TransferStatus::Completed);
        assert_eq!(fx.remote.range_requests(), 3);
        assert!(!local.exists());
        assert!(!engine.resume_store().exists("/f", &local).await);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_is_bounded() {
        let fx = Fixture::new();
        fx.remote.put_file(7, "/f", &pattern(12 * KIB));
        fx.remote.set_range_delay(Some(Duration::from_millis(20)));

        let mut req = DownloadRequest::new("/f", fx.local("f"));
        req.parallel = Some(3);
        fx.engine(KIB as u64, 8)
            .download(&fx.ctx, req, &CancellationToken::new())
            .await
            .unwrap();

        let peak = fx.remote.max_concurrent_ranges();
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "peak concurrency {peak}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_for_one_pair_share_a_transfer() {
        let fx = Fixture::new();
        let data = pattern(6 * KIB);
        fx.remote.put_file(7, "/f", &data);
        fx.remote.set_range_delay(Some(Duration::from_millis(10)));
        let engine = fx.engine(KIB as u64, 2);
        let local = fx.local("f");
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            engine.download(&fx.ctx, DownloadRequest::new("/f", &local), &cancel),
            engine.download(&fx.ctx, DownloadRequest::new("/f", &local), &cancel),
        );
        assert_eq!(a.unwrap().status, TransferStatus::Completed);
        assert_eq!(b.unwrap().status, TransferStatus::Completed);
        assert_eq!(fx.remote.range_requests(), 6);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn progress_is_reported_to_tracker() {
        let fx = Fixture::new();
        fx.remote.put_file(7, "/f", &pattern(2 * KIB));
        let tracker = Arc::new(ProgressTracker::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        tracker.on_progress(Box::new(move |p| s.lock().unwrap().push(p)));

        fx.engine(KIB as u64, 1)
            .with_tracker(Arc::clone(&tracker))
            .download(&fx.ctx, DownloadRequest::new("/f", fx.local("f")), &CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.status, TransferStatus::Completed);
        assert_eq!(last.chunks_done, 2);
        assert_eq!(last.transferred_bytes, 2048);
        assert!(tracker.snapshot().is_empty());
    }
}
