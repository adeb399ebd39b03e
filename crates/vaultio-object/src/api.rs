//! Object-layer interface consumed by the S3 front-end
//!
//! The front-end translates wire requests into these calls; nothing in
//! this crate parses S3.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;
use vaultio_common::{BucketInfo, HealScanMode, Result};
use vaultio_meta::FileInfo;

/// Options shared by object operations.
#[derive(Clone, Debug, Default)]
pub struct ObjectOptions {
    /// Address a specific version.
    pub version_id: Option<Uuid>,
    /// Bucket versioning is enabled for this request.
    pub versioned: bool,
    /// Override the modification time (replication, heal).
    pub mod_time: Option<i64>,
    /// User-defined metadata for writes.
    pub user_defined: HashMap<String, String>,
    /// Skip namespace locking; the caller already serializes access.
    pub no_lock: bool,
    /// Surface free versions to the caller.
    pub incl_free_versions: bool,
}

/// Client-visible description of one object version.
#[derive(Clone, Debug, Default)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub version_id: Option<Uuid>,
    pub is_latest: bool,
    pub delete_marker: bool,
    pub mod_time: i64,
    pub size: i64,
    pub etag: Option<String>,
    pub user_defined: HashMap<String, String>,
    pub parts: usize,
    pub num_versions: usize,
}

impl ObjectInfo {
    /// Project a `FileInfo` into the client-visible record.
    #[must_use]
    pub fn from_file_info(fi: &FileInfo, bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            name: fi.name.clone(),
            version_id: fi.version_id,
            is_latest: fi.is_latest,
            delete_marker: fi.deleted,
            mod_time: fi.mod_time,
            size: fi.size,
            etag: fi.etag.clone(),
            user_defined: fi.metadata.clone(),
            parts: fi.parts.len(),
            num_versions: fi.num_versions,
        }
    }
}

/// Outcome of a delete operation.
#[derive(Clone, Debug, Default)]
pub struct DeleteResult {
    /// Version removed, or the delete marker created.
    pub version_id: Option<Uuid>,
    /// True when a delete marker was written rather than data removed.
    pub delete_marker: bool,
    /// True when the object has no versions left.
    pub is_empty: bool,
}

/// Flat listing result.
#[derive(Clone, Debug, Default)]
pub struct ListObjectsInfo {
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// Heal request options.
#[derive(Clone, Copy, Debug, Default)]
pub struct HealOpts {
    /// Classify only; change nothing.
    pub dry_run: bool,
    /// Purge dangling objects past the parity threshold.
    pub remove: bool,
    /// Scan depth.
    pub scan_mode: HealScanMode,
    /// Skip the namespace lock (background scan on idle regions).
    pub no_lock: bool,
}

/// Drive condition as seen by heal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveState {
    Ok,
    Missing,
    Offline,
    Corrupt,
    Outdated,
}

impl std::fmt::Display for DriveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Missing => "missing",
            Self::Offline => "offline",
            Self::Corrupt => "corrupt",
            Self::Outdated => "outdated",
        };
        f.write_str(s)
    }
}

/// Per-drive heal bookkeeping.
#[derive(Clone, Debug)]
pub struct HealDriveState {
    pub endpoint: String,
    pub state: DriveState,
}

/// Result of healing one object.
#[derive(Clone, Debug, Default)]
pub struct HealResultItem {
    pub bucket: String,
    pub object: String,
    pub version_id: Option<Uuid>,
    pub object_size: i64,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub before: Vec<HealDriveState>,
    pub after: Vec<HealDriveState>,
    /// Drives that needed healing when the call started.
    pub disks_to_heal: usize,
}

impl Default for HealDriveState {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            state: DriveState::Ok,
        }
    }
}

/// Multipart upload descriptor.
#[derive(Clone, Debug, Default)]
pub struct MultipartInfo {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub user_defined: HashMap<String, String>,
}

/// One uploaded part.
#[derive(Clone, Debug, Default)]
pub struct PartInfo {
    pub number: usize,
    pub etag: String,
    pub size: i64,
    pub actual_size: i64,
}

/// Caller-supplied part reference for multipart completion.
#[derive(Clone, Debug)]
pub struct CompletePart {
    pub part_number: usize,
    pub etag: String,
}

/// Byte source for writes, with incremental content hashing.
pub struct PutObjReader {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Declared size; `None` when unknown (chunked upload).
    pub size: Option<u64>,
}

impl PutObjReader {
    /// Wrap a stream of known or unknown length.
    #[must_use]
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>, size: Option<u64>) -> Self {
        Self { reader, size }
    }

    /// Convenience wrapper over an in-memory buffer.
    #[must_use]
    pub fn from_bytes(data: Bytes) -> Self {
        let size = data.len() as u64;
        Self {
            reader: Box::new(std::io::Cursor::new(data)),
            size: Some(size),
        }
    }

    pub(crate) fn into_inner(self) -> (Box<dyn AsyncRead + Send + Unpin>, Option<u64>) {
        (self.reader, self.size)
    }
}

/// The object-layer contract. The S3 wire surface lives above this
/// crate and translates requests into these calls.
#[async_trait]
pub trait ObjectLayer: Send + Sync {
    async fn make_bucket(&self, bucket: &str) -> Result<()>;
    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo>;
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>>;
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        data: PutObjReader,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo>;

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        range: Option<(u64, u64)>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo>;

    async fn get_object_info(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo>;

    async fn delete_object(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<DeleteResult>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        delimiter: Option<&str>,
        max_keys: usize,
    ) -> Result<ListObjectsInfo>;

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> Result<ListObjectsInfo>;

    async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<MultipartInfo>;

    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: usize,
        data: PutObjReader,
    ) -> Result<PartInfo>;

    async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_marker: usize,
        max_parts: usize,
    ) -> Result<Vec<PartInfo>>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()>;

    async fn heal_object(
        &self,
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        opts: &HealOpts,
    ) -> Result<HealResultItem>;

    async fn heal_bucket(&self, bucket: &str, opts: &HealOpts) -> Result<HealResultItem>;
}
