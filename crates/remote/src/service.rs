//! The remote service seam.
//!
//! Engines, the directory cache and the session manager only ever talk to
//! `dyn RemoteService`. [`PcsClient`](crate::PcsClient) implements it over
//! HTTPS; tests use the in-process `MemoryRemote`.

use std::future::Future;
use std::pin::Pin;

use pcs_protocol::{
    AuthTriplet, ByteRange, ChunkReceipt, DirectoryEntry, Identity, PathPair, Quota,
    RapidUploadDigest,
};

use crate::RemoteError;

/// Boxed future returned by every [`RemoteService`] operation.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Operations the client core invokes on the remote storage service.
///
/// Every call takes the credentials explicitly; implementations hold no
/// notion of an "active" account.
pub trait RemoteService: Send + Sync {
    /// Resolves the identity behind a triplet.
    fn authenticate<'a>(&'a self, auth: &'a AuthTriplet) -> RemoteFuture<'a, Identity>;

    fn quota<'a>(&'a self, auth: &'a AuthTriplet) -> RemoteFuture<'a, Quota>;

    /// Lists the direct children of a directory.
    fn list_directory<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
    ) -> RemoteFuture<'a, Vec<DirectoryEntry>>;

    fn metadata<'a>(&'a self, auth: &'a AuthTriplet, path: &'a str)
    -> RemoteFuture<'a, DirectoryEntry>;

    fn make_directory<'a>(&'a self, auth: &'a AuthTriplet, path: &'a str) -> RemoteFuture<'a, ()>;

    fn delete_paths<'a>(&'a self, auth: &'a AuthTriplet, paths: &'a [String])
    -> RemoteFuture<'a, ()>;

    fn move_paths<'a>(&'a self, auth: &'a AuthTriplet, pairs: &'a [PathPair])
    -> RemoteFuture<'a, ()>;

    fn copy_paths<'a>(&'a self, auth: &'a AuthTriplet, pairs: &'a [PathPair])
    -> RemoteFuture<'a, ()>;

    /// Fetches `range` of a file's content.
    fn download_range<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
        range: ByteRange,
    ) -> RemoteFuture<'a, Vec<u8>>;

    /// Asks the service to alias `path` to existing content matching `digest`.
    ///
    /// Returns `Ok(None)` when the service does not hold such content.
    /// Overwrites whatever is at `path`.
    fn rapid_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
        digest: &'a RapidUploadDigest,
    ) -> RemoteFuture<'a, Option<DirectoryEntry>>;

    /// Opens a chunked upload and returns its upload id.
    fn begin_chunked_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        path: &'a str,
        size: u64,
    ) -> RemoteFuture<'a, String>;

    fn upload_chunk<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        upload_id: &'a str,
        index: usize,
        data: Vec<u8>,
    ) -> RemoteFuture<'a, ChunkReceipt>;

    /// Assembles the uploaded chunks, in receipt order, into `path`.
    fn finalize_upload<'a>(
        &'a self,
        auth: &'a AuthTriplet,
        upload_id: &'a str,
        path: &'a str,
        receipts: &'a [ChunkReceipt],
    ) -> RemoteFuture<'a, DirectoryEntry>;
}
