//! Remote error taxonomy.

/// Errors returned by a [`RemoteService`](crate::RemoteService).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("name collision: {0}")]
    NameCollision(String),

    #[error(
        "quota exceeded{}",
        .remaining.map(|r| format!(" ({r} bytes remaining)")).unwrap_or_default()
    )]
    QuotaExceeded { remaining: Option<u64> },

    #[error("remote error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Returns `true` for failures worth retrying at chunk granularity.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` when the credentials must be re-obtained.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Maps a PCS `error_code` to the taxonomy. `path` names the object the
    /// request was about and is used for path-related errors.
    pub fn from_pcs_code(code: i64, message: &str, path: &str) -> Self {
        match code {
            110 | 111 | -6 | 31045 => Self::Auth(format!("{message} (code {code})")),
            31066 | 31202 | -9 => Self::PathNotFound(path.to_string()),
            31061 => Self::NameCollision(path.to_string()),
            31112 => Self::QuotaExceeded { remaining: None },
            _ => Self::Api {
                code,
                message: message.to_string(),
            },
        }
    }
}
