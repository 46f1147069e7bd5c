use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use pcs_protocol::ByteRange;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

// ---------------------------------------------------------------------------
// ChunkPlan
// ---------------------------------------------------------------------------

/// Division of `[0, size)` into fixed-size chunks; the last may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(size: u64, chunk_size: u64) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self { size, chunk_size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks: `ceil(size / chunk_size)`.
    pub fn count(&self) -> usize {
        self.size.div_ceil(self.chunk_size) as usize
    }

    /// Byte range of chunk `index`.
    pub fn range(&self, index: usize) -> ByteRange {
        let start = (index as u64 * self.chunk_size).min(self.size);
        let end = (start + self.chunk_size).min(self.size);
        ByteRange { start, end }
    }
}

// ---------------------------------------------------------------------------
// ChunkBitmap
// ---------------------------------------------------------------------------

/// Per-chunk completion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "BitmapRepr", try_from = "BitmapRepr")]
pub struct ChunkBitmap {
    bits: Vec<bool>,
}

/// Compact form: bit `i` lives in byte `i / 8`, LSB first, hex encoded.
#[derive(Serialize, Deserialize)]
struct BitmapRepr {
    len: usize,
    bits: String,
}

impl From<ChunkBitmap> for BitmapRepr {
    fn from(b: ChunkBitmap) -> Self {
        let mut packed = vec![0u8; b.bits.len().div_ceil(8)];
        for (i, set) in b.bits.iter().enumerate() {
            if *set {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        Self {
            len: b.bits.len(),
            bits: hex::encode(packed),
        }
    }
}

impl TryFrom<BitmapRepr> for ChunkBitmap {
    type Error = String;

    fn try_from(r: BitmapRepr) -> Result<Self, Self::Error> {
        let packed = hex::decode(&r.bits).map_err(|e| e.to_string())?;
        if packed.len() != r.len.div_ceil(8) {
            return Err(format!(
                "bitmap of {} bits needs {} bytes, got {}",
                r.len,
                r.len.div_ceil(8),
                packed.len()
            ));
        }
        let bits = (0..r.len)
            .map(|i| packed[i / 8] & (1 << (i % 8)) != 0)
            .collect();
        Ok(Self { bits })
    }
}

impl ChunkBitmap {
    /// An all-zero bitmap of `len` chunks.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Sets bit `index`. Returns `true` if it was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        match self.bits.get_mut(index) {
            Some(bit) if !*bit => {
                *bit = true;
                true
            }
            _ => false,
        }
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.iter().all(|b| *b)
    }

    /// Indices of the chunks still to transfer, ascending.
    pub fn missing(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, set)| !**set)
            .map(|(i, _)| i)
            .collect()
    }

    /// Bytes covered by set bits under `plan`.
    pub fn bytes_done(&self, plan: &ChunkPlan) -> u64 {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .map(|(i, _)| plan.range(i).len())
            .sum()
    }

    /// The bits as 0/1 values.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bits.iter().map(|b| *b as u8).collect()
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads arbitrary chunks of a local file.
pub struct ChunkReader {
    file: tokio::fs::File,
    file_size: u64,
}

impl ChunkReader {
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self { file, file_size })
    }

    /// Reads exactly the bytes of `range`.
    pub async fn read(&mut self, range: ByteRange) -> Result<Vec<u8>, TransferError> {
        if range.end > self.file_size {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("range ends at {} past file size {}", range.end, self.file_size),
            )));
        }
        let mut buf = vec![0u8; range.len() as usize];
        self.file.seek(SeekFrom::Start(range.start)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Writes chunks at explicit offsets into a preallocated file.
pub struct ChunkWriter {
    path: PathBuf,
    file: tokio::fs::File,
}

impl ChunkWriter {
    /// Creates (or reopens, when `keep_existing`) the destination and sizes
    /// it to `size` bytes. Parent directories are created as needed.
    pub async fn create(path: &Path, size: u64, keep_existing: bool) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!keep_existing)
            .open(path)
            .await?;
        file.set_len(size).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Opens a destination previously sized by [`create`](Self::create).
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Writes `data` at `offset`.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Flushes written data to stable storage.
    pub async fn sync(&mut self) -> Result<(), TransferError> {
        self.file.sync_data().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plan_600k_with_256k_chunks() {
        let plan = ChunkPlan::new(600 * 1024, 256 * 1024);
        assert_eq!(plan.count(), 3);
        assert_eq!(plan.range(0).len(), 256 * 1024);
        assert_eq!(plan.range(1).len(), 256 * 1024);
        assert_eq!(plan.range(2).len(), 88 * 1024);
        assert_eq!(plan.range(2).end, 600 * 1024);
    }

    #[test]
    fn plan_even_division_and_empty() {
        let plan = ChunkPlan::new(1024, 256);
        assert_eq!(plan.count(), 4);
        assert_eq!(plan.range(3), ByteRange { start: 768, end: 1024 });

        let empty = ChunkPlan::new(0, 256);
        assert_eq!(empty.count(), 0);

        let default = ChunkPlan::new(10, 0);
        assert_eq!(default.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(default.count(), 1);
    }

    #[test]
    fn bitmap_tracks_missing_chunks() {
        let mut bitmap = ChunkBitmap::new(5);
        assert!(bitmap.set(1));
        assert!(!bitmap.set(1));
        assert!(bitmap.set(3));
        assert!(!bitmap.set(99));
        assert_eq!(bitmap.missing(), vec![0, 2, 4]);
        assert_eq!(bitmap.count_set(), 2);
        assert!(!bitmap.is_complete());
        assert_eq!(bitmap.to_vec(), vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn bitmap_bytes_done_counts_short_tail() {
        let plan = ChunkPlan::new(10, 4);
        let mut bitmap = ChunkBitmap::new(plan.count());
        bitmap.set(2);
        assert_eq!(bitmap.bytes_done(&plan), 2);
        bitmap.set(0);
        assert_eq!(bitmap.bytes_done(&plan), 6);
    }

    #[test]
    fn bitmap_serializes_compactly() {
        let mut bitmap = ChunkBitmap::new(10);
        bitmap.set(0);
        bitmap.set(9);
        let json = serde_json::to_string(&bitmap).unwrap();
        assert_eq!(json, r#"{"len":10,"bits":"0102"}"#);

        let back: ChunkBitmap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bitmap);

        let bad = serde_json::from_str::<ChunkBitmap>(r#"{"len":20,"bits":"01"}"#);
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn writer_places_chunks_in_any_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/out.bin");
        let plan = ChunkPlan::new(11, 4);
        let data = b"Hello World";

        let mut writer = ChunkWriter::create(&path, plan.size(), false).await.unwrap();
        for index in [2usize, 0, 1] {
            let r = plan.range(index);
            writer
                .write_at(r.start, &data[r.start as usize..r.end as usize])
                .await
                .unwrap();
        }
        writer.sync().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn reopening_keeps_written_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");

        let mut writer = ChunkWriter::create(&path, 8, false).await.unwrap();
        writer.write_at(0, b"abcd").await.unwrap();
        drop(writer);

        let mut writer = ChunkWriter::create(&path, 8, true).await.unwrap();
        writer.write_at(4, b"efgh").await.unwrap();
        drop(writer);

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn reader_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut reader = ChunkReader::open(&path).await.unwrap();
        assert_eq!(reader.file_size(), 10);
        assert_eq!(
            reader.read(ByteRange { start: 6, end: 10 }).await.unwrap(),
            b"6789"
        );
        assert_eq!(
            reader.read(ByteRange { start: 0, end: 3 }).await.unwrap(),
            b"012"
        );
        assert!(reader.read(ByteRange { start: 8, end: 12 }).await.is_err());
    }
}
