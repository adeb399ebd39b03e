//! The `Drive` capability trait and its wire types
//!
//! Drives are small capability interfaces so the object layer can route
//! around offline drives and the test harness can substitute simulated
//! ones.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;
use vaultio_common::Result;
use vaultio_erasure::BitrotVerifier;
use vaultio_meta::FileInfo;

/// Bucket information as seen by one drive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolInfo {
    pub name: String,
    /// Creation time, nanoseconds since the Unix epoch
    pub created: i64,
}

/// File stat result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileProps {
    pub size: u64,
    pub mod_time: i64,
    pub is_dir: bool,
}

/// Raw, unparsed `xl.meta` contents.
#[derive(Clone, Debug)]
pub struct RawFileInfo {
    pub buf: Bytes,
}

/// Result of committing staged data into its final location.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenameDataResp {
    /// Data directory replaced by this commit, already purged.
    pub old_data_dir: Option<Uuid>,
}

/// Options for delete operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    /// Remove directories and their contents.
    pub recursive: bool,
    /// Skip any deferred-removal path and unlink now.
    pub immediate: bool,
}

/// Options for version reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    /// Attach inline data to the returned record.
    pub read_data: bool,
    /// Surface free versions.
    pub incl_free_versions: bool,
}

/// Per-part outcome of `check_parts` / `verify_file`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartCheck {
    Ok,
    Missing,
    Corrupt,
    SizeMismatch,
}

/// Part status per part number, in part-table order.
#[derive(Clone, Debug, Default)]
pub struct CheckPartsResp {
    pub results: Vec<PartCheck>,
}

impl CheckPartsResp {
    /// All parts present and intact.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| *r == PartCheck::Ok)
    }
}

/// Options controlling a `walk_dir` stream.
#[derive(Clone, Debug, Default)]
pub struct WalkDirOptions {
    /// Bucket to walk.
    pub bucket: String,
    /// Directory below the bucket to start from ("" = bucket root).
    pub base_dir: String,
    /// Descend into prefix directories.
    pub recursive: bool,
    /// Only report entries whose name starts with this prefix.
    pub filter_prefix: Option<String>,
    /// Resume marker: skip entries sorting before this name.
    pub forward_to: Option<String>,
    /// Cap on emitted entries; 0 = unlimited.
    pub limit: usize,
}

/// One entry produced by a drive walk: an object (with its raw
/// `xl.meta`) or a prefix directory (trailing `/`, empty metadata).
#[derive(Clone, Debug)]
pub struct MetaCacheEntry {
    pub name: String,
    pub metadata: Bytes,
}

impl MetaCacheEntry {
    /// Whether this entry is a prefix directory rather than an object.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.metadata.is_empty() && self.name.ends_with('/')
    }

    /// Whether this entry carries object metadata.
    #[must_use]
    pub fn is_object(&self) -> bool {
        !self.metadata.is_empty()
    }
}

/// Capability interface of one drive in the erasure set.
///
/// Implementations must route every operation through their online
/// state: a drive that has seen an unrecoverable error reports
/// `DriveOffline` until reconnected, and callers spread the load over
/// the remaining drives.
#[async_trait]
pub trait Drive: Send + Sync + std::fmt::Debug {
    /// Stable identifier for logs and heal results.
    fn endpoint(&self) -> String;

    /// Whether the drive currently accepts operations.
    fn is_online(&self) -> bool;

    /// Force the online state; used on reconnect and by the test
    /// harness.
    fn set_online(&self, online: bool);

    // Volume operations

    async fn make_vol(&self, volume: &str) -> Result<()>;
    async fn stat_vol(&self, volume: &str) -> Result<VolInfo>;
    async fn delete_vol(&self, volume: &str, force: bool) -> Result<()>;
    async fn list_vols(&self) -> Result<Vec<VolInfo>>;

    // File operations

    /// Atomic whole-file write: staged, fsynced, renamed into place.
    async fn write_all(&self, volume: &str, path: &str, data: Bytes) -> Result<()>;

    /// Append to a staging file, creating it (and parents) on demand.
    async fn append_file(&self, volume: &str, path: &str, data: Bytes) -> Result<()>;

    async fn read_all(&self, volume: &str, path: &str) -> Result<Bytes>;

    /// Read `length` bytes at `offset`; short files are corrupt.
    async fn read_file(&self, volume: &str, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Read the whole shard file through a bitrot verifier, then return
    /// the `[offset, offset + length)` window. Digest mismatch fails
    /// with `Corrupt`.
    async fn read_file_with_verify(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        length: u64,
        verifier: &BitrotVerifier,
    ) -> Result<Bytes>;

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileProps>;

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()>;

    /// Commit staged object data: merge `fi` into the destination
    /// `xl.meta`, move the staged data directory into place, and
    /// atomically swap the metadata file.
    async fn rename_data(
        &self,
        src_volume: &str,
        src_path: &str,
        fi: FileInfo,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<RenameDataResp>;

    /// Best-effort removal; missing paths are not errors.
    async fn delete(&self, volume: &str, path: &str, opts: DeleteOptions) -> Result<()>;

    // Metadata operations

    /// Write a fresh `xl.meta` carrying `fi` (creating the object).
    async fn write_metadata(&self, volume: &str, path: &str, fi: FileInfo) -> Result<()>;

    /// Update an existing version's metadata in place.
    async fn update_metadata(&self, volume: &str, path: &str, fi: FileInfo) -> Result<()>;

    /// Read one version (latest if `version_id` is `None`).
    async fn read_version(
        &self,
        volume: &str,
        path: &str,
        version_id: Option<Uuid>,
        opts: ReadOptions,
    ) -> Result<FileInfo>;

    /// Read the raw `xl.meta` buffer.
    async fn read_xl(&self, volume: &str, path: &str) -> Result<RawFileInfo>;

    /// Remove (or rewrite) one version; appends a delete marker when
    /// `fi.deleted` and no prior metadata exists.
    async fn delete_version(&self, volume: &str, path: &str, fi: FileInfo) -> Result<()>;

    // Integrity checks

    /// Presence and size check of every part (heal normal scan).
    async fn check_parts(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp>;

    /// Full bitrot verification of every part (heal deep scan).
    async fn verify_file(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp>;

    // Listing

    /// Single-level directory listing; directories carry a trailing `/`.
    async fn list_dir(&self, volume: &str, dir_path: &str, count: usize) -> Result<Vec<String>>;

    /// Stream entries beneath a prefix in byte-lexicographic order.
    async fn walk_dir(
        &self,
        opts: WalkDirOptions,
        tx: mpsc::Sender<MetaCacheEntry>,
    ) -> Result<()>;
}
