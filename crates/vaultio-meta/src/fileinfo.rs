//! `FileInfo` - the projection of one version into the common record
//! type shared by the drive and object layers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use vaultio_erasure::BitrotAlgorithm;

/// Erasure algorithm identifier stored per version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErasureAlgo {
    #[default]
    ReedSolomon,
}

/// Bitrot digest for one part on one drive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    pub part_number: usize,
    pub algorithm: BitrotAlgorithm,
    pub hash: Vec<u8>,
}

/// Erasure parameters of one object version, as seen by one drive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureInfo {
    /// Coding algorithm
    pub algorithm: ErasureAlgo,
    /// Number of data blocks (M)
    pub data_blocks: usize,
    /// Number of parity blocks (N)
    pub parity_blocks: usize,
    /// Stripe unit in bytes
    pub block_size: usize,
    /// This drive's 1-based shard index
    pub index: usize,
    /// Distribution permutation of 1..=M+N across the set's drives
    pub distribution: Vec<u8>,
    /// Per-part bitrot digests for this drive's shards
    pub checksums: Vec<ChecksumInfo>,
}

impl ErasureInfo {
    /// Look up the stored digest for a part number.
    #[must_use]
    pub fn checksum(&self, part_number: usize) -> Option<&ChecksumInfo> {
        self.checksums.iter().find(|c| c.part_number == part_number)
    }

    /// Whether the parameters describe a usable coding layout.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.data_blocks >= 1
            && self.parity_blocks >= 1
            && self.data_blocks + self.parity_blocks <= 256
            && (self.index >= 1 && self.index <= self.data_blocks + self.parity_blocks)
            && self.distribution.len() == self.data_blocks + self.parity_blocks
    }
}

/// One part of an object version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPartInfo {
    pub number: usize,
    /// Stored size in bytes
    pub size: i64,
    /// Uncompressed client-visible size
    pub actual_size: i64,
    /// Part ETag (multipart uploads only)
    pub etag: Option<String>,
}

/// Common record type describing one version of one object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileInfo {
    /// Bucket the object lives in
    pub volume: String,
    /// Object name
    pub name: String,
    /// Version UUID; `None` when versioning is suspended ("null" version)
    pub version_id: Option<Uuid>,
    /// True when this is the newest non-free version of the object
    pub is_latest: bool,
    /// True for delete markers
    pub deleted: bool,
    /// Per-version data directory holding part files
    pub data_dir: Option<Uuid>,
    /// Modification time, nanoseconds since the Unix epoch
    pub mod_time: i64,
    /// Object size in bytes
    pub size: i64,
    /// Part table, ordered by part number
    pub parts: Vec<ObjectPartInfo>,
    /// Erasure parameters for this drive
    pub erasure: ErasureInfo,
    /// User-visible metadata
    pub metadata: HashMap<String, String>,
    /// System metadata, never surfaced to clients
    pub meta_sys: HashMap<String, Vec<u8>>,
    /// Content ETag
    pub etag: Option<String>,
    /// Inline shard bytes, when the version is stored inline
    pub data: Option<Vec<u8>>,
    /// Number of versions the object had when this record was read
    pub num_versions: usize,
    /// Mod-time of the next-newer version, if any
    pub successor_mod_time: Option<i64>,
    /// True when this record describes a free version
    pub free_version: bool,
}

impl FileInfo {
    /// A fresh object-version skeleton for PUT paths.
    #[must_use]
    pub fn new(volume: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether this record can be acted upon.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.deleted {
            return self.mod_time > 0;
        }
        self.mod_time > 0 && self.erasure.is_valid()
    }

    /// Whether the version's bytes are stored inline in `xl.meta`.
    #[must_use]
    pub fn inline_data(&self) -> bool {
        self.meta_sys.contains_key(crate::META_INLINE_DATA)
    }

    /// Mark the version as inline.
    pub fn set_inline_data(&mut self) {
        self.meta_sys
            .insert(crate::META_INLINE_DATA.to_string(), b"true".to_vec());
    }

    /// Whether the version's content was transitioned to an external
    /// tier, requiring a free version on deletion.
    #[must_use]
    pub fn transitioned(&self) -> bool {
        self.meta_sys.contains_key(crate::META_TRANSITION_TIER)
    }

    /// Version id for on-disk storage: nil UUID stands for "null".
    #[must_use]
    pub fn stored_version_id(&self) -> Uuid {
        self.version_id.unwrap_or(Uuid::nil())
    }

    /// Shard file size on one drive for this version's total size.
    #[must_use]
    pub fn shard_file_size(&self, part_size: i64) -> i64 {
        if part_size < 0 {
            return part_size;
        }
        let m = self.erasure.data_blocks as i64;
        let bs = self.erasure.block_size as i64;
        if part_size == 0 || m == 0 || bs == 0 {
            return 0;
        }
        let shard = (bs + m - 1) / m;
        let full = part_size / bs;
        let rem = part_size % bs;
        full * shard + (rem + m - 1) / m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn erasure_info() -> ErasureInfo {
        ErasureInfo {
            algorithm: ErasureAlgo::ReedSolomon,
            data_blocks: 2,
            parity_blocks: 2,
            block_size: 1 << 20,
            index: 1,
            distribution: vec![1, 2, 3, 4],
            checksums: Vec::new(),
        }
    }

    #[test]
    fn test_erasure_info_validity() {
        assert!(erasure_info().is_valid());
        let mut bad = erasure_info();
        bad.index = 5;
        assert!(!bad.is_valid());
        bad = erasure_info();
        bad.distribution = vec![1, 2];
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_fileinfo_validity() {
        let mut fi = FileInfo::new("bucket", "obj");
        assert!(!fi.is_valid());
        fi.mod_time = 1;
        fi.erasure = erasure_info();
        assert!(fi.is_valid());

        let mut marker = FileInfo::new("bucket", "obj");
        marker.deleted = true;
        marker.mod_time = 1;
        assert!(marker.is_valid());
    }

    #[test]
    fn test_shard_file_size() {
        let mut fi = FileInfo::new("b", "o");
        fi.erasure = erasure_info();
        assert_eq!(fi.shard_file_size(1 << 20), 1 << 19);
        assert_eq!(fi.shard_file_size(0), 0);
        assert_eq!(fi.shard_file_size((1 << 20) + 3), (1 << 19) + 2);
    }
}
