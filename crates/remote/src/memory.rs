//! In-process [`RemoteService`] backend.
//!
//! Keeps one namespace per account and a content store shared by all of
//! them, keyed by content MD5, so rapid upload works across accounts the
//! way it does on the real service. Counters and failure switches let tests
//! observe and disturb traffic.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use pcs_protocol::path;
use pcs_protocol::{
    AuthTriplet, ByteRange, ChunkReceipt, DirectoryEntry, Identity, PathPair, Quota,
    RapidUploadDigest, SLICE_LENGTH,
};

use crate::service::{RemoteFuture, RemoteService};
use crate::RemoteError;

const DEFAULT_CAPACITY: u64 = 1 << 40;

#[derive(Debug, Clone)]
struct Node {
    entry: DirectoryEntry,
    /// Key into the content store; `None` for directories.
    content: Option<String>,
}

#[derive(Debug, Default)]
struct Namespace {
    nodes: BTreeMap<String, Node>,
}

#[derive(Debug)]
struct PendingUpload {
    uid: u64,
    size: u64,
    chunks: HashMap<usize, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<String, Identity>,
    namespaces: HashMap<u64, Namespace>,
    contents: HashMap<String, Arc<Vec<u8>>>,
    uploads: HashMap<String, PendingUpload>,
    list_calls: HashMap<String, usize>,
    next_fs_id: u64,
    next_upload: u64,
    capacity: u64,
    transient_ranges: usize,
    ranges_before_failure: Option<usize>,
    transient_chunk_uploads: usize,
}

/// In-memory remote storage.
pub struct MemoryRemote {
    state: Mutex<State>,
    range_delay: Mutex<Option<Duration>>,
    range_requests: AtomicUsize,
    chunk_uploads: AtomicUsize,
    rapid_hits: AtomicUsize,
    ranges_in_flight: AtomicUsize,
    max_ranges_in_flight: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                capacity: DEFAULT_CAPACITY,
                next_fs_id: 1,
                ..State::default()
            }),
            range_delay: Mutex::new(None),
            range_requests: AtomicUsize::new(0),
            chunk_uploads: AtomicUsize::new(0),
            rapid_hits: AtomicUsize::new(0),
            ranges_in_flight: AtomicUsize::new(0),
            max_ranges_in_flight: AtomicUsize::new(0),
        }
    }

    /// Registers an account reachable with `bduss`.
    pub fn register_account(&self, bduss: &str, uid: u64, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.accounts.insert(
            bduss.to_string(),
            Identity {
                uid,
                name: name.to_string(),
            },
        );
        state.namespaces.entry(uid).or_default();
    }

    /// Invalidates a previously registered token.
    pub fn revoke(&self, bduss: &str) {
        self.state.lock().unwrap().accounts.remove(bduss);
    }

    /// Sets the per-account storage capacity.
    pub fn set_capacity(&self, bytes: u64) {
        self.state.lock().unwrap().capacity = bytes;
    }

    /// Writes a file into `uid`'s namespace, creating parent directories.
    pub fn put_file(&self, uid: u64, file_path: &str, data: &[u8]) -> DirectoryEntry {
        let mut state = self.state.lock().unwrap();
        let key = store_content(&mut state, data.to_vec());
        let size = data.len() as u64;
        insert_file(&mut state, uid, &path::normalize(file_path), size, key)
    }

    /// Stores content without any file referencing it.
    pub fn seed_content(&self, data: &[u8]) -> String {
        let mut state = self.state.lock().unwrap();
        store_content(&mut state, data.to_vec())
    }

    /// Returns the bytes behind a file, if it exists.
    pub fn file_content(&self, uid: u64, file_path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let node = state
            .namespaces
            .get(&uid)?
            .nodes
            .get(&path::normalize(file_path))?;
        let key = node.content.as_ref()?;
        state.contents.get(key).map(|c| c.as_ref().clone())
    }

    /// Returns `true` if `path` exists in `uid`'s namespace.
    pub fn exists(&self, uid: u64, file_path: &str) -> bool {
        let p = path::normalize(file_path);
        let state = self.state.lock().unwrap();
        p == "/"
            || state
                .namespaces
                .get(&uid)
                .is_some_and(|ns| ns.nodes.contains_key(&p))
    }

    /// Changes the MD5 reported for a file without touching its content.
    pub fn override_reported_md5(&self, uid: u64, file_path: &str, md5: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state
            .namespaces
            .get_mut(&uid)
            .and_then(|ns| ns.nodes.get_mut(&path::normalize(file_path)))
        {
            node.entry.md5 = md5.to_string();
        }
    }

    /// Makes the next `n` range requests fail with a transient error.
    pub fn fail_next_ranges(&self, n: usize) {
        self.state.lock().unwrap().transient_ranges = n;
    }

    /// After `n` more successful range requests, every further one fails
    /// permanently. `None` lifts the failure.
    pub fn fail_ranges_after(&self, n: Option<usize>) {
        self.state.lock().unwrap().ranges_before_failure = n;
    }

    /// Makes the next `n` chunk uploads fail with a transient error.
    pub fn fail_next_chunk_uploads(&self, n: usize) {
        self.state.lock().unwrap().transient_chunk_uploads = n;
    }

    /// Delays every range response.
    pub fn set_range_delay(&self, delay: Option<Duration>) {
        *self.range_delay.lock().unwrap() = delay;
    }

    /// Number of `list_directory` calls seen for `path`.
    pub fn list_calls(&self, dir: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .list_calls
            .get(&path::normalize(dir))
            .copied()
            .unwrap_or(0)
    }

    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }

    pub fn chunk_uploads(&self) -> usize {
        self.chunk_uploads.load(Ordering::SeqCst)
    }

    pub fn rapid_upload_hits(&self) -> usize {
        self.rapid_hits.load(Ordering::SeqCst)
    }

    /// Highest number of range requests observed in flight at once.
    pub fn max_concurrent_ranges(&self) -> usize {
        self.max_ranges_in_flight.load(Ordering::SeqCst)
    }

    fn identify(&self, auth: &AuthTriplet) -> Result<u64, RemoteError> {
        let state = self.state.lock().unwrap();
        state
            .accounts
            .get(&auth.bduss)
            .map(|id| id.uid)
            .ok_or_else(|| RemoteError::Auth("unknown token".to_string()))
    }
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn store_content(state: &mut State, data: Vec<u8>) -> String {
    let key = md5_hex(&data);
    state.contents.entry(key.clone()).or_insert_with(|| Arc::new(data));
    key
}

fn next_fs_id(state: &mut State) -> u64 {
    let id = state.next_fs_id;
    state.next_fs_id += 1;
    id
}

fn ensure_dirs(state: &mut State, uid: u64, dir: &str) {
    let mut current = String::new();
    for part in dir.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(part);
        let exists = state
            .namespaces
            .get(&uid)
            .is_some_and(|ns| ns.nodes.contains_key(&current));
        if !exists {
            let fs_id = next_fs_id(state);
            let node = Node {
                entry: DirectoryEntry {
                    fs_id,
                    path: current.clone(),
                    is_dir: true,
                    size: 0,
                    mtime: now_secs(),
                    md5: String::new(),
                    crc32: None,
                },
                content: None,
            };
            state
                .namespaces
                .entry(uid)
                .or_default()
                .nodes
                .insert(current.clone(), node);
        }
    }
}

fn insert_file(state: &mut State, uid: u64, file_path: &str, size: u64, key: String) -> DirectoryEntry {
    ensure_dirs(state, uid, &path::parent(file_path));
    let fs_id = next_fs_id(state);
    let entry = DirectoryEntry {
        fs_id,
        path: file_path.to_string(),
        is_dir: false,
        size,
        mtime: now_secs(),
        md5: key.clone(),
        crc32: None,
    };
    state.namespaces.entry(uid).or_default().nodes.insert(
        file_path.to_string(),
        Node {
            entry: entry.clone(),
            content: Some(key),
        },
    );
    entry
}

fn used_bytes(state: &State, uid: u64) -> u64 {
    state
        .namespaces
        .get(&uid)
        .map(|ns| ns.nodes.values().map(|n| n.entry.size).sum())
        .unwrap_or(0)
}

fn lookup(state: &State, uid: u64, p: &str) -> Option<DirectoryEntry> {
    if p == "/" {
        return Some(DirectoryEntry {
            fs_id: 0,
            path: "/".to_string(),
            is_dir: true,
            size: 0,
            mtime: 0,
            md5: String::new(),
            crc32: None,
        });
    }
    state
        .namespaces
        .get(&uid)
        .and_then(|ns| ns.nodes.get(p))
        .map(|n| n.entry.clone())
}

/// Returns `path` and every node beneath it.
fn subtree(state: &State, uid: u64, p: &str) -> Vec<String> {
    state
        .namespaces
        .get(&uid)
        .map(|ns| {
            ns.nodes
                .keys()
                .filter(|k| path::is_within(k, p))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn transplant(state: &mut State, uid: u64, pair: &PathPair, keep_source: bool) -> Result<(), RemoteError> {
    let from = path::normalize(&pair.from);
    let to = path::normalize(&pair.to);
    if lookup(state, uid, &from).is_none() {
        return Err(RemoteError::PathNotFound(from));
    }
    if lookup(state, uid, &to).is_some() {
        return Err(RemoteError::NameCollision(to));
    }
    if path::is_within(&to, &from) {
        return Err(RemoteError::Api {
            code: 31062,
            message: format!("cannot place {from} inside itself"),
        });
    }

    ensure_dirs(state, uid, &path::parent(&to));
    for old in subtree(state, uid, &from) {
        let ns = state.namespaces.entry(uid).or_default();
        let node = if keep_source {
            ns.nodes.get(&old).cloned()
        } else {
            ns.nodes.remove(&old)
        };
        if let Some(mut node) = node {
            let new_path = format!("{to}{}", &old[from.len()..]);
            node.entry.path = new_path.clone();
            if keep_source {
                node.entry.fs_id = next_fs_id(state);
            }
            state.namespaces.entry(uid).or_default().nodes.insert(new_path, node);
        }
    }
    Ok(())
}

impl RemoteService for MemoryRemote {
    fn authenticate<'a>(&'a self, auth: &'a AuthTriplet) -> RemoteFuture<'a, Identity> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            state
                .accounts
                .get(&auth.bduss)
                .cloned()
                .ok_or_else(|| RemoteError::Auth("unknown token".to_string()))
        })
    }

    fn quota<'a>(&'a self, auth: &'a AuthTriplet) -> RemoteFuture<'a, Quota> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let state = self.state.lock().unwrap();
            Ok(Quota {
                total: state.capacity,
                used: used_bytes(&state, uid),
            })
        })
    }

    fn list_directory<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        dir: &'a str,
    ) -> RemoteFuture<'a, Vec<DirectoryEntry>> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let dir = path::normalize(dir);
            let mut state = self.state.lock().unwrap();
            *state.list_calls.entry(dir.clone()).or_default() += 1;

            match lookup(&state, uid, &dir) {
                None => return Err(RemoteError::PathNotFound(dir)),
                Some(e) if !e.is_dir => {
                    return Err(RemoteError::Api {
                        code: 31023,
                        message: format!("{dir} is not a directory"),
                    });
                }
                Some(_) => {}
            }

            Ok(state
                .namespaces
                .get(&uid)
                .map(|ns| {
                    ns.nodes
                        .values()
                        .filter(|n| n.entry.path != dir && path::parent(&n.entry.path) == dir)
                        .map(|n| n.entry.clone())
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn metadata<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        p: &'a str,
    ) -> RemoteFuture<'a, DirectoryEntry> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let p = path::normalize(p);
            let state = self.state.lock().unwrap();
            lookup(&state, uid, &p).ok_or(RemoteError::PathNotFound(p))
        })
    }

    fn make_directory<'a>(&'a self, auth: &'a AuthTriplet, p: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let p = path::normalize(p);
            let mut state = self.state.lock().unwrap();
            if lookup(&state, uid, &p).is_some() {
                return Err(RemoteError::NameCollision(p));
            }
            ensure_dirs(&mut state, uid, &p);
            Ok(())
        })
    }

    fn delete_paths<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        paths: &'a [String],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let mut state = self.state.lock().unwrap();
            let targets: Vec<String> = paths.iter().map(|p| path::normalize(p)).collect();
            if let Some(missing) = targets.iter().find(|p| lookup(&state, uid, p).is_none()) {
                return Err(RemoteError::PathNotFound(missing.clone()));
            }
            for target in targets {
                for p in subtree(&state, uid, &target) {
                    if let Some(ns) = state.namespaces.get_mut(&uid) {
                        ns.nodes.remove(&p);
                    }
                }
            }
            Ok(())
        })
    }

    fn move_paths<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        pairs: &'a [PathPair],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let mut state = self.state.lock().unwrap();
            for pair in pairs {
                transplant(&mut state, uid, pair, false)?;
            }
            Ok(())
        })
    }

    fn copy_paths<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        pairs: &'a [PathPair],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let mut state = self.state.lock().unwrap();
            for pair in pairs {
                transplant(&mut state, uid, pair, true)?;
            }
            Ok(())
        })
    }

    fn download_range<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        p: &'a str,
        range: ByteRange,
    ) -> RemoteFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            self.range_requests.fetch_add(1, Ordering::SeqCst);

            let in_flight = self.ranges_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_ranges_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            let delay = *self.range_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.ranges_in_flight.fetch_sub(1, Ordering::SeqCst);

            let p = path::normalize(p);
            let mut state = self.state.lock().unwrap();

            if state.transient_ranges > 0 {
                state.transient_ranges -= 1;
                return Err(RemoteError::Transient("injected range failure".to_string()));
            }
            match state.ranges_before_failure {
                Some(0) => {
                    return Err(RemoteError::Api {
                        code: 31326,
                        message: "injected permanent failure".to_string(),
                    });
                }
                Some(n) => state.ranges_before_failure = Some(n - 1),
                None => {}
            }

            let node = state
                .namespaces
                .get(&uid)
                .and_then(|ns| ns.nodes.get(&p))
                .ok_or_else(|| RemoteError::PathNotFound(p.clone()))?;
            let key = node.content.as_ref().ok_or_else(|| RemoteError::Api {
                code: 31023,
                message: format!("{p} is a directory"),
            })?;
            let content = state
                .contents
                .get(key)
                .ok_or_else(|| RemoteError::InvalidResponse(format!("content lost for {p}")))?;

            if range.end > content.len() as u64 || range.start > range.end {
                return Err(RemoteError::Api {
                    code: 416,
                    message: format!("range {}-{} outside {p}", range.start, range.end),
                });
            }
            Ok(content[range.start as usize..range.end as usize].to_vec())
        })
    }

    fn rapid_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        p: &'a str,
        digest: &'a RapidUploadDigest,
    ) -> RemoteFuture<'a, Option<DirectoryEntry>> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let p = path::normalize(p);
            let mut state = self.state.lock().unwrap();

            let matches = state.contents.get(&digest.content_md5).is_some_and(|c| {
                let slice = &c[..c.len().min(SLICE_LENGTH as usize)];
                c.len() as u64 == digest.length && md5_hex(slice) == digest.slice_md5
            });
            if !matches {
                return Ok(None);
            }
            if matches!(lookup(&state, uid, &p), Some(e) if e.is_dir) {
                return Err(RemoteError::NameCollision(p));
            }

            let free = state.capacity.saturating_sub(used_bytes(&state, uid));
            if digest.length > free {
                return Err(RemoteError::QuotaExceeded {
                    remaining: Some(free),
                });
            }

            self.rapid_hits.fetch_add(1, Ordering::SeqCst);
            let entry = insert_file(&mut state, uid, &p, digest.length, digest.content_md5.clone());
            Ok(Some(entry))
        })
    }

    fn begin_chunked_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        _p: &'a str,
        size: u64,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let mut state = self.state.lock().unwrap();
            let free = state.capacity.saturating_sub(used_bytes(&state, uid));
            if size > free {
                return Err(RemoteError::QuotaExceeded {
                    remaining: Some(free),
                });
            }
            state.next_upload += 1;
            let id = format!("upload-{}", state.next_upload);
            state.uploads.insert(
                id.clone(),
                PendingUpload {
                    uid,
                    size,
                    chunks: HashMap::new(),
                },
            );
            Ok(id)
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        upload_id: &'a str,
        index: usize,
        data: Vec<u8>,
    ) -> RemoteFuture<'a, ChunkReceipt> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let mut state = self.state.lock().unwrap();
            if state.transient_chunk_uploads > 0 {
                state.transient_chunk_uploads -= 1;
                return Err(RemoteError::Transient("injected upload failure".to_string()));
            }
            let upload = state
                .uploads
                .get_mut(upload_id)
                .filter(|u| u.uid == uid)
                .ok_or_else(|| RemoteError::Api {
                    code: 31363,
                    message: format!("unknown upload {upload_id}"),
                })?;
            let md5 = md5_hex(&data);
            upload.chunks.insert(index, data);
            self.chunk_uploads.fetch_add(1, Ordering::SeqCst);
            Ok(ChunkReceipt { index, md5 })
        })
    }

    fn finalize_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        upload_id: &'a str,
        p: &'a str,
        receipts: &'a [ChunkReceipt],
    ) -> RemoteFuture<'a, DirectoryEntry> {
        Box::pin(async move {
            let uid = self.identify(auth)?;
            let p = path::normalize(p);
            let mut state = self.state.lock().unwrap();
            let upload = state
                .uploads
                .remove(upload_id)
                .filter(|u| u.uid == uid)
                .ok_or_else(|| RemoteError::Api {
                    code: 31363,
                    message: format!("unknown upload {upload_id}"),
                })?;

            let mut content = Vec::with_capacity(upload.size as usize);
            for receipt in receipts {
                let chunk = upload.chunks.get(&receipt.index).ok_or_else(|| RemoteError::Api {
                    code: 31363,
                    message: format!("chunk {} was never uploaded", receipt.index),
                })?;
                if md5_hex(chunk) != receipt.md5 {
                    return Err(RemoteError::Api {
                        code: 31352,
                        message: format!("chunk {} digest mismatch", receipt.index),
                    });
                }
                content.extend_from_slice(chunk);
            }
            if content.len() as u64 != upload.size {
                return Err(RemoteError::Api {
                    code: 31352,
                    message: format!(
                        "assembled {} bytes, expected {}",
                        content.len(),
                        upload.size
                    ),
                });
            }

            let size = content.len() as u64;
            let key = store_content(&mut state, content);
            Ok(insert_file(&mut state, uid, &p, size, key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthTriplet {
        AuthTriplet::new("tok", "", "")
    }

    fn remote() -> MemoryRemote {
        let r = MemoryRemote::new();
        r.register_account("tok", 7, "alice");
        r
    }

    #[tokio::test]
    async fn unknown_token_is_auth_error() {
        let r = remote();
        let err = r
            .list_directory(&AuthTriplet::new("nope", "", ""), "/")
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn list_shows_direct_children_only() {
        let r = remote();
        r.put_file(7, "/a/b/c.txt", b"c");
        r.put_file(7, "/a/d.txt", b"d");

        let mut names: Vec<String> = r
            .list_directory(&auth(), "/a")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["b", "d.txt"]);
        assert_eq!(r.list_calls("/a"), 1);
    }

    #[tokio::test]
    async fn move_rewrites_subtree() {
        let r = remote();
        r.put_file(7, "/src/x/y.txt", b"y");
        r.move_paths(
            &auth(),
            &[PathPair {
                from: "/src".into(),
                to: "/dst".into(),
            }],
        )
        .await
        .unwrap();
        assert!(!r.exists(7, "/src/x/y.txt"));
        assert_eq!(r.file_content(7, "/dst/x/y.txt").unwrap(), b"y");
    }

    #[tokio::test]
    async fn rapid_upload_needs_matching_slice() {
        let r = remote();
        let key = r.seed_content(b"hello");
        let good = RapidUploadDigest {
            length: 5,
            content_md5: key.clone(),
            slice_md5: key.clone(),
            crc32: 0,
        };
        let bad = RapidUploadDigest {
            slice_md5: "0".repeat(32),
            ..good.clone()
        };
        assert!(r.rapid_upload(&auth(), "/h.txt", &bad).await.unwrap().is_none());
        assert!(r.rapid_upload(&auth(), "/h.txt", &good).await.unwrap().is_some());
        assert_eq!(r.rapid_upload_hits(), 1);
    }

    #[tokio::test]
    async fn chunked_upload_assembles_in_receipt_order() {
        let r = remote();
        let id = r.begin_chunked_upload(&auth(), "/f", 6).await.unwrap();
        let second = r.upload_chunk(&auth(), &id, 1, b"def".to_vec()).await.unwrap();
        let first = r.upload_chunk(&auth(), &id, 0, b"abc".to_vec()).await.unwrap();
        r.finalize_upload(&auth(), &id, "/f", &[first, second])
            .await
            .unwrap();
        assert_eq!(r.file_content(7, "/f").unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn capacity_limits_uploads() {
        let r = remote();
        r.set_capacity(10);
        r.put_file(7, "/big", &[0u8; 8]);
        let err = r.begin_chunked_upload(&auth(), "/more", 5).await.unwrap_err();
        assert!(matches!(
            err,
            RemoteError::QuotaExceeded {
                remaining: Some(2)
            }
        ));
    }

    #[tokio::test]
    async fn injected_range_failures() {
        let r = remote();
        r.put_file(7, "/f", b"0123456789");
        r.fail_next_ranges(1);
        let range = ByteRange { start: 0, end: 4 };
        assert!(r.download_range(&auth(), "/f", range).await.unwrap_err().is_transient());
        assert_eq!(r.download_range(&auth(), "/f", range).await.unwrap(), b"0123");

        r.fail_ranges_after(Some(1));
        assert!(r.download_range(&auth(), "/f", range).await.is_ok());
        let err = r.download_range(&auth(), "/f", range).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
