//! Vaultio Common - shared types, errors and configuration
//!
//! This crate defines the vocabulary used by every other vaultio crate:
//! the common error type with its quorum/corruption/transient semantics,
//! validated bucket and object name newtypes, and the erasure-set
//! configuration with all of its operational knobs.

pub mod config;
pub mod error;
pub mod types;

pub use config::{HealScanMode, INLINE_DATA_THRESHOLD, LockConfig, QuorumPolicy, SetConfig};
pub use error::{Error, Result};
pub use types::{BucketInfo, BucketName, BucketNameError, ObjectKey, ObjectKeyError};

/// Reserved namespace used for staging, multipart uploads and listing caches.
///
/// Never listed, never addressable as a bucket.
pub const RESERVED_BUCKET: &str = ".vaultio.sys";

/// Staging area for atomic renames, relative to [`RESERVED_BUCKET`].
pub const RESERVED_TMP: &str = "tmp";

/// Multipart upload staging area, relative to [`RESERVED_BUCKET`].
pub const RESERVED_MULTIPART: &str = "multipart";

/// Per-bucket bookkeeping (listing caches), relative to [`RESERVED_BUCKET`].
pub const RESERVED_BUCKET_META: &str = "buckets";

/// Name of the per-object metadata file.
pub const META_FILE: &str = "xl.meta";
