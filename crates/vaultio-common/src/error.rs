//! Error types for vaultio
//!
//! One error enum spans all subsystems so that per-drive and per-peer
//! failures can be aggregated into quorum decisions without conversion
//! noise. Helper predicates encode which classes retry and which do not.

use crate::types::{BucketNameError, ObjectKeyError};
use thiserror::Error;

/// Common result type for vaultio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for vaultio
#[derive(Debug, Error)]
pub enum Error {
    // Drive errors
    #[error("drive I/O error: {0}")]
    DriveIo(#[from] std::io::Error),

    #[error("drive not found")]
    DriveNotFound,

    #[error("drive is offline")]
    DriveOffline,

    #[error("drive access denied")]
    DriveAccessDenied,

    #[error("faulty drive")]
    FaultyDrive,

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume already exists: {0}")]
    VolumeExists(String),

    #[error("volume not empty: {0}")]
    VolumeNotEmpty(String),

    #[error("file not found")]
    FileNotFound,

    #[error("file version not found")]
    FileVersionNotFound,

    #[error("file is corrupt")]
    FileCorrupt,

    #[error("bitrot checksum mismatch")]
    Corrupt,

    #[error("path too long")]
    PathTooLong,

    #[error("is not a regular file")]
    NotRegularFile,

    #[error("done for now")]
    DoneForNow,

    // Object-layer errors
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketExists(String),

    #[error("bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound { bucket: String, object: String },

    #[error("version not found: {bucket}/{object} ({version_id})")]
    VersionNotFound {
        bucket: String,
        object: String,
        version_id: String,
    },

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(#[from] BucketNameError),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(#[from] ObjectKeyError),

    #[error("invalid version id: {0}")]
    InvalidVersionId(String),

    #[error("entity too large: {size} bytes exceeds {max_size}")]
    EntityTooLarge { size: u64, max_size: u64 },

    #[error("bad digest: expected {expected}, computed {computed}")]
    BadDigest { expected: String, computed: String },

    #[error("object exists as directory prefix")]
    ObjectExistsAsDirectory,

    #[error("method not allowed")]
    MethodNotAllowed,

    // Quorum errors
    #[error("read quorum not met: {have}/{want} drives")]
    ReadQuorum { have: usize, want: usize },

    #[error("write quorum not met: {have}/{want} drives")]
    WriteQuorum { have: usize, want: usize },

    #[error("object is dangling and cannot be repaired")]
    DanglingObject,

    // Erasure errors
    #[error("insufficient shards for reconstruction: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    #[error("erasure coding error: {0}")]
    Erasure(String),

    // Multipart errors
    #[error("no such upload: {0}")]
    UploadNotFound(String),

    #[error("invalid part: {0}")]
    InvalidPart(usize),

    #[error("part too small: part {part} is {size} bytes")]
    PartTooSmall { part: usize, size: u64 },

    // Lock errors
    #[error("lock acquire timed out: {0}")]
    LockTimeout(String),

    #[error("lock conflict on: {0}")]
    LockConflict(String),

    #[error("lock lost: refresh quorum failed")]
    LockLost,

    #[error("lock peer unreachable: {0}")]
    PeerUnreachable(String),

    // Metadata errors
    #[error("metadata parse error: {0}")]
    MetaParse(String),

    #[error("metadata CRC mismatch: want {want:#010x}, got {got:#010x}")]
    MetaCrcMismatch { want: u32, got: u32 },

    #[error("unknown metadata version {major}.{minor}")]
    MetaUnknownVersion { major: u16, minor: u16 },

    // Generic
    #[error("operation canceled")]
    Canceled,

    #[error("request timeout")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Object-not-found shorthand
    pub fn object_not_found(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    /// Version-not-found shorthand
    pub fn version_not_found(
        bucket: impl Into<String>,
        object: impl Into<String>,
        version_id: impl Into<String>,
    ) -> Self {
        Self::VersionNotFound {
            bucket: bucket.into(),
            object: object.into(),
            version_id: version_id.into(),
        }
    }

    /// Check if this error is transient and worth retrying with backoff.
    ///
    /// `Corrupt` and the not-found family never retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::PeerUnreachable(_)
                | Self::DriveNotFound
                | Self::DriveOffline
                | Self::LockConflict(_)
        )
    }

    /// Check if this is a not-found class error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BucketNotFound(_)
                | Self::ObjectNotFound { .. }
                | Self::VersionNotFound { .. }
                | Self::VolumeNotFound(_)
                | Self::FileNotFound
                | Self::FileVersionNotFound
                | Self::UploadNotFound(_)
        )
    }

    /// Check if this error indicates on-disk corruption (bitrot or
    /// unparsable metadata), which excludes the drive copy from quorum.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt | Self::FileCorrupt | Self::MetaCrcMismatch { .. } | Self::MetaParse(_)
        )
    }

    /// Check if this drive error is fatal enough to mark the drive offline.
    #[must_use]
    pub fn is_drive_fatal(&self) -> bool {
        matches!(self, Self::FaultyDrive | Self::DriveAccessDenied)
    }

    /// Compare errors by kind, ignoring payloads.
    ///
    /// Quorum reduction counts per-drive errors; two `VolumeNotFound`s for
    /// the same volume must count as the same outcome.
    #[must_use]
    pub fn kind_eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            // io::Error is not Clone; preserve kind and message.
            Self::DriveIo(e) => Self::DriveIo(std::io::Error::new(e.kind(), e.to_string())),
            Self::DriveNotFound => Self::DriveNotFound,
            Self::DriveOffline => Self::DriveOffline,
            Self::DriveAccessDenied => Self::DriveAccessDenied,
            Self::FaultyDrive => Self::FaultyDrive,
            Self::VolumeNotFound(v) => Self::VolumeNotFound(v.clone()),
            Self::VolumeExists(v) => Self::VolumeExists(v.clone()),
            Self::VolumeNotEmpty(v) => Self::VolumeNotEmpty(v.clone()),
            Self::FileNotFound => Self::FileNotFound,
            Self::FileVersionNotFound => Self::FileVersionNotFound,
            Self::FileCorrupt => Self::FileCorrupt,
            Self::Corrupt => Self::Corrupt,
            Self::PathTooLong => Self::PathTooLong,
            Self::NotRegularFile => Self::NotRegularFile,
            Self::DoneForNow => Self::DoneForNow,
            Self::BucketNotFound(b) => Self::BucketNotFound(b.clone()),
            Self::BucketExists(b) => Self::BucketExists(b.clone()),
            Self::BucketNotEmpty(b) => Self::BucketNotEmpty(b.clone()),
            Self::ObjectNotFound { bucket, object } => Self::ObjectNotFound {
                bucket: bucket.clone(),
                object: object.clone(),
            },
            Self::VersionNotFound {
                bucket,
                object,
                version_id,
            } => Self::VersionNotFound {
                bucket: bucket.clone(),
                object: object.clone(),
                version_id: version_id.clone(),
            },
            Self::InvalidBucketName(e) => Self::InvalidBucketName(e.clone()),
            Self::InvalidObjectKey(e) => Self::InvalidObjectKey(e.clone()),
            Self::InvalidVersionId(v) => Self::InvalidVersionId(v.clone()),
            Self::EntityTooLarge { size, max_size } => Self::EntityTooLarge {
                size: *size,
                max_size: *max_size,
            },
            Self::BadDigest { expected, computed } => Self::BadDigest {
                expected: expected.clone(),
                computed: computed.clone(),
            },
            Self::ObjectExistsAsDirectory => Self::ObjectExistsAsDirectory,
            Self::MethodNotAllowed => Self::MethodNotAllowed,
            Self::ReadQuorum { have, want } => Self::ReadQuorum {
                have: *have,
                want: *want,
            },
            Self::WriteQuorum { have, want } => Self::WriteQuorum {
                have: *have,
                want: *want,
            },
            Self::DanglingObject => Self::DanglingObject,
            Self::InsufficientShards { have, need } => Self::InsufficientShards {
                have: *have,
                need: *need,
            },
            Self::Erasure(m) => Self::Erasure(m.clone()),
            Self::UploadNotFound(u) => Self::UploadNotFound(u.clone()),
            Self::InvalidPart(p) => Self::InvalidPart(*p),
            Self::PartTooSmall { part, size } => Self::PartTooSmall {
                part: *part,
                size: *size,
            },
            Self::LockTimeout(r) => Self::LockTimeout(r.clone()),
            Self::LockConflict(r) => Self::LockConflict(r.clone()),
            Self::LockLost => Self::LockLost,
            Self::PeerUnreachable(p) => Self::PeerUnreachable(p.clone()),
            Self::MetaParse(m) => Self::MetaParse(m.clone()),
            Self::MetaCrcMismatch { want, got } => Self::MetaCrcMismatch {
                want: *want,
                got: *got,
            },
            Self::MetaUnknownVersion { major, minor } => Self::MetaUnknownVersion {
                major: *major,
                minor: *minor,
            },
            Self::Canceled => Self::Canceled,
            Self::Timeout => Self::Timeout,
            Self::Config(m) => Self::Config(m.clone()),
            Self::Serialization(m) => Self::Serialization(m.clone()),
            Self::Internal(m) => Self::Internal(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::PeerUnreachable("peer1".into()).is_retryable());
        assert!(!Error::Corrupt.is_retryable());
        assert!(!Error::VolumeNotFound("b".into()).is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::FileNotFound.is_not_found());
        assert!(Error::object_not_found("b", "o").is_not_found());
        assert!(!Error::Corrupt.is_not_found());
    }

    #[test]
    fn test_error_corruption() {
        assert!(Error::Corrupt.is_corruption());
        assert!(Error::MetaCrcMismatch { want: 1, got: 2 }.is_corruption());
        assert!(!Error::FileNotFound.is_corruption());
    }

    #[test]
    fn test_kind_eq_ignores_payload() {
        let a = Error::VolumeNotFound("x".into());
        let b = Error::VolumeNotFound("y".into());
        assert!(a.kind_eq(&b));
        assert!(!a.kind_eq(&Error::FileNotFound));
    }
}
