use serde::{Deserialize, Serialize};

/// Credential bundle sent with every authenticated remote call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTriplet {
    pub bduss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ptoken: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stoken: String,
}

impl AuthTriplet {
    pub fn new(bduss: impl Into<String>, ptoken: impl Into<String>, stoken: impl Into<String>) -> Self {
        Self {
            bduss: bduss.into(),
            ptoken: ptoken.into(),
            stoken: stoken.into(),
        }
    }

    /// Returns `true` when no primary token is present.
    pub fn is_empty(&self) -> bool {
        self.bduss.is_empty()
    }

    /// Renders the triplet as a `Cookie` header value, skipping empty parts.
    pub fn cookie_header(&self) -> String {
        [
            ("BDUSS", &self.bduss),
            ("PTOKEN", &self.ptoken),
            ("STOKEN", &self.stoken),
        ]
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
    }
}

/// Identity the remote service associates with a triplet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u64,
    pub name: String,
}

/// Storage quota of an account, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
}

impl Quota {
    /// Remaining free space.
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// One remote filesystem object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    #[serde(default)]
    pub fs_id: u64,
    pub path: String,
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    /// Modification time, unix seconds.
    #[serde(default)]
    pub mtime: i64,
    /// Content MD5 (hex). Empty for directories or when the service does not report it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub md5: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<u32>,
}

impl DirectoryEntry {
    /// Final path component.
    pub fn name(&self) -> &str {
        crate::path::base_name(&self.path)
    }
}

/// Size of the leading slice covered by `slice_md5`.
pub const SLICE_LENGTH: u64 = 256 * 1024;

/// Digest set identifying file content for rapid upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RapidUploadDigest {
    pub length: u64,
    /// MD5 of the whole content (hex).
    pub content_md5: String,
    /// MD5 of the first [`SLICE_LENGTH`] bytes (hex).
    pub slice_md5: String,
    /// CRC-32 (IEEE) of the whole content; 0 means "not supplied".
    #[serde(default)]
    pub crc32: u32,
}

impl RapidUploadDigest {
    /// Renders the equivalent `rapidupload` command line for `name`.
    pub fn to_command(&self, name: &str) -> String {
        format!(
            "rapidupload -length={} -md5={} -slicemd5={} -crc32={} {}",
            self.length, self.content_md5, self.slice_md5, self.crc32, name
        )
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source/destination pair for move and copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPair {
    pub from: String,
    pub to: String,
}

/// Acknowledgement for one uploaded chunk, passed back on finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub index: usize,
    pub md5: String,
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Download,
    Upload,
}

/// Lifecycle state of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Point-in-time progress of one transfer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub task_id: String,
    pub kind: TransferKind,
    pub status: TransferStatus,
    pub remote_path: String,
    pub local_path: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub chunks_done: usize,
    pub chunks_total: usize,
    pub bytes_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TransferProgress {
    /// Returns the progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.status == TransferStatus::Completed { 100.0 } else { 0.0 };
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_skips_empty_tokens() {
        let t = AuthTriplet::new("b1", "", "s1");
        assert_eq!(t.cookie_header(), "BDUSS=b1; STOKEN=s1");

        let full = AuthTriplet::new("b", "p", "s");
        assert_eq!(full.cookie_header(), "BDUSS=b; PTOKEN=p; STOKEN=s");
    }

    #[test]
    fn triplet_omit_empty() {
        let t = AuthTriplet::new("b1", "", "");
        let json = serde_json::to_string(&t).unwrap();
        assert!(!json.contains("ptoken"));
        assert!(!json.contains("stoken"));
        let parsed: AuthTriplet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn quota_free_saturates() {
        let q = Quota { total: 10, used: 25 };
        assert_eq!(q.free(), 0);
        let q = Quota { total: 100, used: 25 };
        assert_eq!(q.free(), 75);
    }

    #[test]
    fn entry_name_is_last_component() {
        let e = DirectoryEntry {
            fs_id: 1,
            path: "/music/song.mp3".into(),
            is_dir: false,
            size: 3,
            mtime: 0,
            md5: String::new(),
            crc32: None,
        };
        assert_eq!(e.name(), "song.mp3");
    }

    #[test]
    fn entry_field_names() {
        let json = r#"{"fsId":7,"path":"/a","isDir":true}"#;
        let e: DirectoryEntry = serde_json::from_str(json).unwrap();
        assert_eq!(e.fs_id, 7);
        assert!(e.is_dir);
        assert_eq!(e.size, 0);
        assert!(e.md5.is_empty());
    }

    #[test]
    fn rapid_upload_command_line() {
        let d = RapidUploadDigest {
            length: 10,
            content_md5: "aa".into(),
            slice_md5: "bb".into(),
            crc32: 42,
        };
        assert_eq!(
            d.to_command("f.txt"),
            "rapidupload -length=10 -md5=aa -slicemd5=bb -crc32=42 f.txt"
        );
    }

    #[test]
    fn byte_range_len() {
        let r = ByteRange { start: 256, end: 600 };
        assert_eq!(r.len(), 344);
        assert!(!r.is_empty());
        assert!(ByteRange { start: 5, end: 5 }.is_empty());
    }

    #[test]
    fn transfer_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TransferStatus::Paused).unwrap(),
            "\"paused\""
        );
        assert_eq!(
            serde_json::to_string(&TransferKind::Download).unwrap(),
            "\"download\""
        );
    }

    #[test]
    fn progress_percentage() {
        let mut p = TransferProgress {
            task_id: "t".into(),
            kind: TransferKind::Download,
            status: TransferStatus::Running,
            remote_path: "/a".into(),
            local_path: "a".into(),
            total_bytes: 1000,
            transferred_bytes: 250,
            chunks_done: 1,
            chunks_total: 4,
            bytes_per_second: 0.0,
            eta_secs: None,
            error: String::new(),
        };
        assert!((p.percentage() - 25.0).abs() < f64::EPSILON);

        p.total_bytes = 0;
        p.status = TransferStatus::Completed;
        assert!((p.percentage() - 100.0).abs() < f64::EPSILON);
    }
}
