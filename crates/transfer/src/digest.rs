//! Content digests.
//!
//! One streaming pass produces the whole [`RapidUploadDigest`]: MD5 of the
//! content, MD5 of the first [`SLICE_LENGTH`] bytes, CRC-32 (IEEE) and the
//! length. For content no longer than the slice both MD5s cover the same
//! bytes and are therefore equal.

use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use pcs_protocol::{RapidUploadDigest, SLICE_LENGTH};

use crate::TransferError;

const READ_BUF: usize = 64 * 1024;

/// Hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes the digest set of everything `reader` yields.
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<RapidUploadDigest> {
    let mut full = Md5::new();
    let mut slice = Md5::new();
    let mut crc = crc32fast::Hasher::new();
    let mut length: u64 = 0;
    let mut buf = vec![0u8; READ_BUF];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let data = &buf[..n];

        if length < SLICE_LENGTH {
            let take = ((SLICE_LENGTH - length) as usize).min(n);
            slice.update(&data[..take]);
        }
        full.update(data);
        crc.update(data);
        length += n as u64;
    }

    Ok(RapidUploadDigest {
        length,
        content_md5: hex::encode(full.finalize()),
        slice_md5: hex::encode(slice.finalize()),
        crc32: crc.finalize(),
    })
}

/// Digest set of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> RapidUploadDigest {
    // Reading from a slice cannot fail.
    digest_reader(data).unwrap_or_else(|_| RapidUploadDigest {
        length: data.len() as u64,
        content_md5: md5_hex(data),
        slice_md5: md5_hex(&data[..data.len().min(SLICE_LENGTH as usize)]),
        crc32: crc32fast::hash(data),
    })
}

/// Digest set of a local file, hashed on the blocking pool.
pub async fn digest_file(path: &Path) -> Result<RapidUploadDigest, TransferError> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        digest_reader(std::io::BufReader::new(file))
    })
    .await??;
    Ok(digest)
}

/// Hex MD5 of a local file, hashed on the blocking pool.
pub async fn md5_file(path: &Path) -> Result<String, TransferError> {
    let path: PathBuf = path.to_path_buf();
    let md5 = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await??;
    Ok(md5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_md5() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn ten_byte_file_is_deterministic_and_slice_equals_full() {
        let data = b"0123456789";
        let a = digest_bytes(data);
        let b = digest_bytes(data);
        assert_eq!(a, b);
        assert_eq!(a.length, 10);
        assert_eq!(a.slice_md5, a.content_md5);
        assert_eq!(a.crc32, crc32fast::hash(data));
    }

    #[test]
    fn slice_covers_first_256_kib_only() {
        let mut data = vec![7u8; SLICE_LENGTH as usize];
        let head = md5_hex(&data);
        data.extend_from_slice(b"tail");

        let d = digest_bytes(&data);
        assert_eq!(d.slice_md5, head);
        assert_ne!(d.content_md5, d.slice_md5);
        assert_eq!(d.content_md5, md5_hex(&data));
        assert_eq!(d.length, SLICE_LENGTH + 4);
    }

    #[test]
    fn exactly_slice_length_has_equal_hashes() {
        let data = vec![1u8; SLICE_LENGTH as usize];
        let d = digest_bytes(&data);
        assert_eq!(d.slice_md5, d.content_md5);
    }

    /// Yields at most `step` bytes per read to exercise buffer boundaries.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data: Vec<u8> = (0..600 * 1024).map(|i| (i % 251) as u8).collect();
        let one_shot = digest_bytes(&data);
        let streamed = digest_reader(Trickle {
            data: &data,
            step: 1000,
        })
        .unwrap();
        assert_eq!(one_shot, streamed);
        assert_eq!(
            streamed.slice_md5,
            md5_hex(&data[..SLICE_LENGTH as usize])
        );
    }

    #[tokio::test]
    async fn file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| i as u8).collect();
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        assert_eq!(digest_file(&path).await.unwrap(), digest_bytes(&data));
        assert_eq!(md5_file(&path).await.unwrap(), md5_hex(&data));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = digest_file(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
