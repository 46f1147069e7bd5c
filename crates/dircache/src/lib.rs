//! Remote directory cache.
//!
//! Listings are cached per (account, normalized directory path) with a TTL.
//! Each path has its own async lock: a `list` and an `invalidate` on the
//! same path exclude each other, while lookups on different paths never
//! contend. The garbage collector only ever `try_lock`s a slot, so it never
//! waits behind a listing in progress.
//!
//! The cache is advisory. Callers that must see current remote state use
//! [`DirCache::list_fresh`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pcs_protocol::DirectoryEntry;
use pcs_protocol::path;
use pcs_remote::{RemoteError, RemoteService};
use pcs_session::SessionContext;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors from cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One cached directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub entries: Vec<DirectoryEntry>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.fetched_at < ttl,
            Err(_) => true,
        }
    }

    /// Every entry must be a direct child of `dir`.
    fn is_consistent(&self, dir: &str) -> bool {
        self.entries
            .iter()
            .all(|e| e.path != dir && path::parent(&e.path) == dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    uid: u64,
    path: String,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MirrorFile {
    ttl_secs: u64,
    records: Vec<MirrorRecord>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MirrorRecord {
    uid: u64,
    path: String,
    #[serde(flatten)]
    entry: CacheEntry,
}

/// Shared directory listing cache.
pub struct DirCache {
    remote: Arc<dyn RemoteService>,
    ttl: Duration,
    slots: RwLock<HashMap<CacheKey, Arc<Mutex<Slot>>>>,
    mirror: Option<PathBuf>,
}

impl DirCache {
    pub fn new(remote: Arc<dyn RemoteService>, ttl: Duration) -> Self {
        Self {
            remote,
            ttl,
            slots: RwLock::new(HashMap::new()),
            mirror: None,
        }
    }

    /// Creates a cache backed by a disk mirror at `mirror`, preloading the
    /// live records it holds. An unreadable mirror is ignored.
    pub fn with_mirror(remote: Arc<dyn RemoteService>, ttl: Duration, mirror: PathBuf) -> Self {
        let mut cache = Self::new(remote, ttl);
        let loaded = load_mirror(&mirror, ttl, Utc::now());
        if !loaded.is_empty() {
            debug!(records = loaded.len(), path = %mirror.display(), "directory cache mirror loaded");
        }
        {
            let slots = cache.slots.get_mut().unwrap();
            for (key, entry) in loaded {
                slots.insert(key, Arc::new(Mutex::new(Slot { entry: Some(entry) })));
            }
        }
        cache.mirror = Some(mirror);
        cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Lists `dir`, serving a live cached listing when there is one.
    pub async fn list(
        &self,
        ctx: &SessionContext,
        dir: &str,
    ) -> Result<Vec<DirectoryEntry>, CacheError> {
        self.list_at(ctx, dir, Utc::now()).await
    }

    /// [`list`](Self::list) with an explicit clock.
    pub async fn list_at(
        &self,
        ctx: &SessionContext,
        dir: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DirectoryEntry>, CacheError> {
        let key = CacheKey {
            uid: ctx.uid,
            path: path::normalize(dir),
        };
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;

        if let Some(cached) = &slot.entry {
            if !cached.is_live(self.ttl, now) {
                debug!(path = %key.path, "cache expired");
            } else if !cached.is_consistent(&key.path) {
                debug!(path = %key.path, "cache inconsistency, refetching");
            } else {
                debug!(path = %key.path, "cache hit");
                return Ok(cached.entries.clone());
            }
        }

        debug!(path = %key.path, "cache miss");
        let entries = self.fetch(ctx, &key.path).await?;
        slot.entry = Some(CacheEntry {
            entries: entries.clone(),
            fetched_at: now,
        });
        Ok(entries)
    }

    /// Lists `dir` from the remote service and refreshes the cached copy.
    pub async fn list_fresh(
        &self,
        ctx: &SessionContext,
        dir: &str,
    ) -> Result<Vec<DirectoryEntry>, CacheError> {
        let key = CacheKey {
            uid: ctx.uid,
            path: path::normalize(dir),
        };
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;
        let entries = self.fetch(ctx, &key.path).await?;
        slot.entry = Some(CacheEntry {
            entries: entries.clone(),
            fetched_at: Utc::now(),
        });
        Ok(entries)
    }

    /// Metadata for one path, looked up in its parent's listing and
    /// confirmed with the remote service if the listing lacks it.
    pub async fn meta(
        &self,
        ctx: &SessionContext,
        target: &str,
    ) -> Result<DirectoryEntry, CacheError> {
        let target = path::normalize(target);
        if target == "/" {
            return Ok(root_entry());
        }

        let siblings = self.list(ctx, &path::parent(&target)).await?;
        if let Some(found) = siblings.into_iter().find(|e| e.path == target) {
            return Ok(found);
        }
        Ok(self.remote.metadata(&ctx.auth, &target).await?)
    }

    /// Drops the cached listing of `dir`.
    pub async fn invalidate(&self, uid: u64, dir: &str) {
        let key = CacheKey {
            uid,
            path: path::normalize(dir),
        };
        let slot = self.slots.read().unwrap().get(&key).cloned();
        if let Some(slot) = slot {
            slot.lock().await.entry = None;
            debug!(path = %key.path, "cache invalidated");
        }
    }

    /// Drops the cached listings of `dir` and everything beneath it.
    pub async fn invalidate_subtree(&self, uid: u64, dir: &str) {
        let root = path::normalize(dir);
        let affected: Vec<Arc<Mutex<Slot>>> = self
            .slots
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.uid == uid && path::is_within(&k.path, &root))
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for slot in &affected {
            slot.lock().await.entry = None;
        }
        debug!(path = %root, slots = affected.len(), "cache subtree invalidated");
    }

    /// Drops the listing of `target`'s parent, then walks up and drops every
    /// ancestor listing that does not show the directory leading to
    /// `target`. For mutations that create missing parent directories.
    pub async fn invalidate_ancestors(&self, uid: u64, target: &str) {
        let mut child = path::normalize(target);
        let mut first = true;
        while child != "/" {
            let dir = path::parent(&child);
            let key = CacheKey {
                uid,
                path: dir.clone(),
            };
            let slot = self.slots.read().unwrap().get(&key).cloned();
            let mut known = false;
            if let Some(slot) = slot {
                let mut guard = slot.lock().await;
                if let Some(entry) = &guard.entry {
                    known = entry.entries.iter().any(|e| e.path == child);
                    if first || !known {
                        guard.entry = None;
                        debug!(path = %dir, "cache invalidated");
                    }
                }
            }
            // A listing that already showed `child` proves everything above
            // it existed before.
            if known {
                break;
            }
            first = false;
            child = dir;
        }
    }

    /// Evicts expired and empty slots. Returns how many were evicted.
    pub fn garbage_collect(&self) -> usize {
        self.garbage_collect_at(Utc::now())
    }

    /// [`garbage_collect`](Self::garbage_collect) with an explicit clock.
    pub fn garbage_collect_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<(CacheKey, Arc<Mutex<Slot>>)> = self
            .slots
            .read()
            .unwrap()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut evict = Vec::new();
        for (key, slot) in candidates {
            // Busy slots are being refreshed right now.
            let Ok(guard) = slot.try_lock() else {
                continue;
            };
            let stale = guard
                .entry
                .as_ref()
                .is_none_or(|e| !e.is_live(self.ttl, now));
            if stale {
                evict.push(key);
            }
        }

        if !evict.is_empty() {
            let mut slots = self.slots.write().unwrap();
            for key in &evict {
                slots.remove(key);
            }
        }
        debug!(evicted = evict.len(), "cache garbage collected");
        evict.len()
    }

    /// Number of slots currently held.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes live listings to the disk mirror, if one is configured.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };

        let now = Utc::now();
        let snapshot: Vec<(CacheKey, Arc<Mutex<Slot>>)> = self
            .slots
            .read()
            .unwrap()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut records = Vec::new();
        for (key, slot) in snapshot {
            let guard = slot.lock().await;
            if let Some(entry) = guard.entry.as_ref().filter(|e| e.is_live(self.ttl, now)) {
                records.push(MirrorRecord {
                    uid: key.uid,
                    path: key.path,
                    entry: entry.clone(),
                });
            }
        }

        let file = MirrorFile {
            ttl_secs: self.ttl.as_secs(),
            records,
        };
        let json = serde_json::to_vec(&file)?;
        pcs_config::write_atomic(mirror, &json)?;
        debug!(records = file.records.len(), path = %mirror.display(), "directory cache mirror flushed");
        Ok(())
    }

    /// Runs garbage collection and mirror flushes every `interval` until
    /// `cancel` fires.
    pub fn spawn_gc(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.garbage_collect();
                        if let Err(e) = self.flush().await {
                            warn!(error = %e, "failed to flush directory cache mirror");
                        }
                    }
                }
            }
            debug!("cache GC task stopped");
        })
    }

    fn slot(&self, key: &CacheKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().unwrap().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    async fn fetch(
        &self,
        ctx: &SessionContext,
        dir: &str,
    ) -> Result<Vec<DirectoryEntry>, CacheError> {
        let mut entries = self.remote.list_directory(&ctx.auth, dir).await?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

fn root_entry() -> DirectoryEntry {
    DirectoryEntry {
        fs_id: 0,
        path: "/".to_string(),
        is_dir: true,
        size: 0,
        mtime: 0,
        md5: String::new(),
        crc32: None,
    }
}

/// Reads the mirror, keeping records still live under both the recorded
/// TTL and the current one.
fn load_mirror(path: &Path, ttl: Duration, now: DateTime<Utc>) -> Vec<(CacheKey, CacheEntry)> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    let file: MirrorFile = match serde_json::from_slice(&data) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt directory cache mirror");
            return Vec::new();
        }
    };

    let effective = ttl.min(Duration::from_secs(file.ttl_secs));
    file.records
        .into_iter()
        .filter(|r| r.entry.is_live(effective, now))
        .map(|r| {
            (
                CacheKey {
                    uid: r.uid,
                    path: path::normalize(&r.path),
                },
                r.entry,
            )
        })
        .collect()
}
