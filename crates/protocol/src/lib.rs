//! Shared data model for the PCS netdisk client: credentials, directory
//! entries, rapid-upload digests and transfer progress snapshots.

pub mod path;
pub mod types;

// Re-export primary types for convenience.
pub use types::{
    AuthTriplet, ByteRange, ChunkReceipt, DirectoryEntry, Identity, PathPair, Quota,
    RapidUploadDigest, SLICE_LENGTH, TransferKind, TransferProgress, TransferStatus,
};
