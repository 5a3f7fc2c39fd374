use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

/// Error type shared by every layer of the engine.
///
/// Wrapper layers add context to the message but never change the variant,
/// so callers can match on the kind that the originating layer reported.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("blob not found: '{0}'")]
    BlobNotFound(String),

    #[error("blob already exists: '{0}'")]
    BlobAlreadyExists(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("authentication failed: wrong password or corrupted data")]
    MacFailed,

    #[error("invalid byte range: offset {offset}, length {length}")]
    InvalidRange { offset: i64, length: i64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("backend does not support setting blob times")]
    SetTimeUnsupported,

    #[error("backend capacity is not known")]
    CapacityUnknown,

    #[error("repository is read-only")]
    ReadOnly,

    #[error("maintenance lease is held by '{0}'")]
    LockBusy(String),

    #[error("repository format is not compatible: {0}")]
    FormatIncompatible(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("content of {0} bytes exceeds the maximum packable size")]
    Oversized(u64),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression id: {0}")]
    UnknownCompression(u32),

    #[error("manifest not found: '{0}'")]
    ManifestNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("maintenance finished with {} task failure(s): {}", .0.len(), .0.join("; "))]
    MaintenanceFailed(Vec<String>),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Transient errors that a retry wrapper may re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Unavailable(_))
    }

    /// Whether this error reports a missing blob or content.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StrataError::BlobNotFound(_)
                | StrataError::ContentNotFound(_)
                | StrataError::ManifestNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StrataError::Unavailable("503".into()).is_retryable());
        assert!(!StrataError::PermissionDenied("nope".into()).is_retryable());
        assert!(!StrataError::BlobNotFound("p01".into()).is_retryable());
    }

    #[test]
    fn not_found_classification() {
        assert!(StrataError::BlobNotFound("n01".into()).is_not_found());
        assert!(StrataError::ContentNotFound("abcd".into()).is_not_found());
        assert!(!StrataError::MacFailed.is_not_found());
    }
}
