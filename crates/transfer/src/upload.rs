//! Rapid and chunked uploads.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use pcs_dircache::DirCache;
use pcs_protocol::{
    AuthTriplet, ChunkReceipt, DirectoryEntry, RapidUploadDigest, TransferKind, path,
};
use pcs_remote::RemoteService;
use pcs_session::SessionContext;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::{ChunkPlan, ChunkReader};
use crate::digest::digest_file;
use crate::inflight::InflightRegistry;
use crate::progress::ProgressTracker;
use crate::resume::ResumeStore;
use crate::types::{TransferSettings, TransferTask};
use crate::{RetryPolicy, TransferError};

/// One local file to store at a remote path. An existing remote file is
/// overwritten.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Worker pool size override.
    pub parallel: Option<usize>,
}

impl UploadRequest {
    pub fn new(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            parallel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub entry: DirectoryEntry,
    /// No bytes were sent: the service already held the content.
    pub rapid: bool,
    pub digest: RapidUploadDigest,
    pub chunks_uploaded: usize,
}

/// Stores local files remotely, rapid upload first.
pub struct UploadEngine {
    remote: Arc<dyn RemoteService>,
    cache: Arc<DirCache>,
    inflight: InflightRegistry<UploadOutcome>,
    settings: TransferSettings,
    tracker: Option<Arc<ProgressTracker>>,
}

impl UploadEngine {
    pub fn new(remote: Arc<dyn RemoteService>, cache: Arc<DirCache>, settings: TransferSettings) -> Self {
        Self {
            remote,
            cache,
            inflight: InflightRegistry::new(),
            settings,
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Uploads `req.local_path` to `req.remote_path`.
    pub async fn upload(
        &self,
        ctx: &SessionContext,
        req: UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        let remote_path = path::normalize(&req.remote_path);
        let key = format!("upload:{}", ResumeStore::key(&remote_path, &req.local_path));
        self.inflight
            .run(&key, || self.run(ctx, &remote_path, &req, cancel))
            .await
    }

    /// Stores `remote_path` from a digest computed earlier, without reading
    /// any local file. Fails with [`TransferError::RapidUploadMiss`] when the
    /// service does not hold the content.
    pub async fn rapid_upload(
        &self,
        ctx: &SessionContext,
        remote_path: &str,
        digest: &RapidUploadDigest,
    ) -> Result<DirectoryEntry, TransferError> {
        let remote_path = path::normalize(remote_path);
        let entry = self
            .try_rapid(ctx, &remote_path, digest, &CancellationToken::new())
            .await?
            .ok_or_else(|| TransferError::RapidUploadMiss(remote_path.clone()))?;
        self.cache.invalidate_ancestors(ctx.uid, &remote_path).await;
        Ok(entry)
    }

    async fn try_rapid(
        &self,
        ctx: &SessionContext,
        remote_path: &str,
        digest: &RapidUploadDigest,
        cancel: &CancellationToken,
    ) -> Result<Option<DirectoryEntry>, TransferError> {
        let remote = &self.remote;
        let auth = &ctx.auth;
        let hit = self
            .settings
            .retry
            .run("rapid upload", cancel, move || {
                remote.rapid_upload(auth, remote_path, digest)
            })
            .await?;
        debug!(remote = remote_path, hit = hit.is_some(), "rapid upload check");
        Ok(hit)
    }

    async fn run(
        &self,
        ctx: &SessionContext,
        remote_path: &str,
        req: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        let meta = tokio::fs::metadata(&req.local_path).await?;
        if !meta.is_file() {
            return Err(TransferError::NotAFile(req.local_path.display().to_string()));
        }

        let digest = digest_file(&req.local_path).await?;
        let result = match self.try_rapid(ctx, remote_path, &digest, cancel).await? {
            Some(entry) => {
                info!(remote = remote_path, size = digest.length, "rapid upload hit");
                Ok(UploadOutcome {
                    entry,
                    rapid: true,
                    digest,
                    chunks_uploaded: 0,
                })
            }
            None => self.chunked(ctx, remote_path, req, digest, cancel).await,
        };

        if result.is_ok() {
            self.cache.invalidate_ancestors(ctx.uid, remote_path).await;
        }
        result
    }

    async fn chunked(
        &self,
        ctx: &SessionContext,
        remote_path: &str,
        req: &UploadRequest,
        digest: RapidUploadDigest,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        let plan = ChunkPlan::new(digest.length, self.settings.chunk_size);
        let task = Arc::new(TransferTask::new(
            TransferKind::Upload,
            remote_path,
            &req.local_path,
            plan,
        ));
        if let Some(tracker) = &self.tracker {
            tracker.track(Arc::clone(&task));
        }

        let result = self.send_chunks(ctx, remote_path, req, &plan, &task, cancel).await;
        match &result {
            Ok(_) => task.complete(),
            Err(e) => task.fail(&e.to_string()),
        }
        if let Some(tracker) = &self.tracker {
            tracker.finish(&task.id());
        }

        match result {
            Ok(entry) => {
                info!(remote = remote_path, size = digest.length, chunks = plan.count(), "upload finished");
                Ok(UploadOutcome {
                    entry,
                    rapid: false,
                    digest,
                    chunks_uploaded: plan.count(),
                })
            }
            Err(e) => {
                warn!(remote = remote_path, error = %e, "upload failed");
                Err(e)
            }
        }
    }

    async fn send_chunks(
        &self,
        ctx: &SessionContext,
        remote_path: &str,
        req: &UploadRequest,
        plan: &ChunkPlan,
        task: &Arc<TransferTask>,
        cancel: &CancellationToken,
    ) -> Result<DirectoryEntry, TransferError> {
        let remote = &self.remote;
        let auth = &ctx.auth;
        let size = plan.size();
        let upload_id = self
            .settings
            .retry
            .run("begin upload", cancel, move || {
                remote.begin_chunked_upload(auth, remote_path, size)
            })
            .await?;

        let workers = self.settings.workers(req.parallel).min(plan.count());
        info!(remote = remote_path, size, chunks = plan.count(), workers, "chunked upload started");
        task.start();

        let stop = cancel.child_token();
        let shared = Arc::new(UploadShared {
            remote: Arc::clone(&self.remote),
            auth: ctx.auth.clone(),
            upload_id: upload_id.clone(),
            local_path: req.local_path.clone(),
            plan: *plan,
            queue: Mutex::new((0..plan.count()).collect()),
            receipts: Mutex::new(vec![None; plan.count()]),
            task: Arc::clone(task),
            retry: self.settings.retry.clone(),
            stop: stop.clone(),
        });

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(upload_worker(Arc::clone(&shared)));
        }
        let mut first_err: Option<TransferError> = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(TransferError::from).and_then(|r| r);
            if let Err(e) = outcome {
                stop.cancel();
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        let receipts: Vec<ChunkReceipt> = {
            let slots = shared.receipts.lock().unwrap();
            if slots.iter().any(Option::is_none) {
                // Workers only stop early on cancellation.
                return Err(TransferError::Cancelled);
            }
            slots.iter().flatten().cloned().collect()
        };

        let id = upload_id.as_str();
        let receipts = receipts.as_slice();
        self.settings
            .retry
            .run("finalize upload", cancel, move || {
                remote.finalize_upload(auth, id, remote_path, receipts)
            })
            .await
    }
}

struct UploadShared {
    remote: Arc<dyn RemoteService>,
    auth: AuthTriplet,
    upload_id: String,
    local_path: PathBuf,
    plan: ChunkPlan,
    queue: Mutex<VecDeque<usize>>,
    receipts: Mutex<Vec<Option<ChunkReceipt>>>,
    task: Arc<TransferTask>,
    retry: RetryPolicy,
    stop: CancellationToken,
}

impl UploadShared {
    fn next_chunk(&self) -> Option<usize> {
        if self.stop.is_cancelled() {
            return None;
        }
        self.queue.lock().unwrap().pop_front()
    }
}

async fn upload_worker(shared: Arc<UploadShared>) -> Result<(), TransferError> {
    let mut reader = ChunkReader::open(&shared.local_path).await?;
    while let Some(index) = shared.next_chunk() {
        let data = reader.read(shared.plan.range(index)).await?;
        let remote = &shared.remote;
        let auth = &shared.auth;
        let id = shared.upload_id.as_str();
        let receipt = shared
            .retry
            .run("chunk upload", &shared.stop, move || {
                remote.upload_chunk(auth, id, index, data.clone())
            })
            .await?;

        shared.receipts.lock().unwrap()[index] = Some(receipt);
        shared.task.complete_chunk(index);
    }
    Ok(())
}
