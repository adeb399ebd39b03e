//! Version records: the journal entries inside `xl.meta`
//!
//! Three kinds of entry exist: regular object versions, delete markers,
//! and legacy-layout objects preserved until overwritten. A fourth
//! shape, the free version, is a delete marker flagged to schedule
//! asynchronous cleanup of externally tiered content; it is invisible
//! to normal listings.

use crate::fileinfo::{ChecksumInfo, ErasureAlgo, ErasureInfo, FileInfo, ObjectPartInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use vaultio_common::{Error, Result};
use vaultio_erasure::BitrotAlgorithm;

/// Version flagged as a free version (tier-cleanup tombstone).
pub const FLAG_FREE_VERSION: u8 = 1 << 0;
/// Version owns an on-disk data directory.
pub const FLAG_USES_DATA_DIR: u8 = 1 << 1;

/// Discriminates the journal entry kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum VersionType {
    Object = 1,
    Delete = 2,
    Legacy = 3,
}

/// A regular erasure-coded object version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaObject {
    /// Version ID; nil UUID stands for the "null" version
    pub version_id: Uuid,
    /// Data directory holding this version's part files
    pub data_dir: Uuid,
    /// Erasure coding algorithm
    pub erasure_algorithm: ErasureAlgo,
    /// Erasure data blocks (M)
    pub erasure_m: usize,
    /// Erasure parity blocks (N)
    pub erasure_n: usize,
    /// Erasure block size
    pub erasure_block_size: usize,
    /// This drive's 1-based shard index
    pub erasure_index: usize,
    /// Distribution permutation of 1..=M+N
    pub erasure_dist: Vec<u8>,
    /// Bitrot checksum algorithm
    pub bitrot_algorithm: BitrotAlgorithm,
    /// Per-part bitrot digests for this drive
    pub part_checksums: Vec<Vec<u8>>,
    /// Part numbers
    pub part_numbers: Vec<usize>,
    /// Part ETags (multipart only)
    pub part_etags: Vec<String>,
    /// Part stored sizes
    pub part_sizes: Vec<i64>,
    /// Part actual (uncompressed) sizes
    pub part_actual_sizes: Vec<i64>,
    /// Object version size
    pub size: i64,
    /// Modification time, ns since epoch
    pub mod_time: i64,
    /// System metadata
    pub meta_sys: HashMap<String, Vec<u8>>,
    /// User metadata
    pub meta_user: HashMap<String, String>,
}

impl MetaObject {
    /// Whether this version's shard bytes live inline in `xl.meta`.
    #[must_use]
    pub fn inline_data(&self) -> bool {
        self.meta_sys.contains_key(crate::META_INLINE_DATA)
    }

    /// Whether the version owns an on-disk data directory.
    #[must_use]
    pub fn uses_data_dir(&self) -> bool {
        !self.inline_data()
    }
}

/// A delete marker, or (with the free-version flag) a tier-cleanup
/// tombstone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaDeleteMarker {
    pub version_id: Uuid,
    pub mod_time: i64,
    pub meta_sys: HashMap<String, Vec<u8>>,
}

impl MetaDeleteMarker {
    #[must_use]
    pub fn free_version(&self) -> bool {
        self.meta_sys.contains_key(crate::META_FREE_VERSION)
    }
}

/// A legacy-layout object, kept opaque until overwritten.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaLegacyObject {
    pub version_id: Uuid,
    pub data_dir: Uuid,
    pub size: i64,
    pub mod_time: i64,
    pub etag: Option<String>,
    pub meta_user: HashMap<String, String>,
}

/// One journal entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Version {
    Object(MetaObject),
    Delete(MetaDeleteMarker),
    Legacy(MetaLegacyObject),
}

impl Version {
    #[must_use]
    pub fn version_type(&self) -> VersionType {
        match self {
            Self::Object(_) => VersionType::Object,
            Self::Delete(_) => VersionType::Delete,
            Self::Legacy(_) => VersionType::Legacy,
        }
    }

    #[must_use]
    pub fn version_id(&self) -> Uuid {
        match self {
            Self::Object(o) => o.version_id,
            Self::Delete(d) => d.version_id,
            Self::Legacy(l) => l.version_id,
        }
    }

    #[must_use]
    pub fn mod_time(&self) -> i64 {
        match self {
            Self::Object(o) => o.mod_time,
            Self::Delete(d) => d.mod_time,
            Self::Legacy(l) => l.mod_time,
        }
    }

    #[must_use]
    pub fn free_version(&self) -> bool {
        matches!(self, Self::Delete(d) if d.free_version())
    }

    /// The data directory this version owns, if any.
    #[must_use]
    pub fn data_dir(&self) -> Option<Uuid> {
        match self {
            Self::Object(o) if o.uses_data_dir() => Some(o.data_dir),
            Self::Legacy(l) => Some(l.data_dir),
            _ => None,
        }
    }

    /// Structural validity check; invalid entries poison the whole file.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Object(o) => {
                o.mod_time > 0
                    && o.erasure_m >= 1
                    && o.erasure_n >= 1
                    && o.erasure_m + o.erasure_n <= 256
                    && o.erasure_dist.len() == o.erasure_m + o.erasure_n
            }
            Self::Delete(d) => d.mod_time > 0,
            Self::Legacy(l) => l.mod_time > 0,
        }
    }

    /// The lightweight header used by the indexed layout and listings.
    #[must_use]
    pub fn header(&self) -> VersionHeader {
        let mut flags = 0u8;
        if self.free_version() {
            flags |= FLAG_FREE_VERSION;
        }
        if matches!(self, Self::Object(o) if o.uses_data_dir()) || matches!(self, Self::Legacy(_))
        {
            flags |= FLAG_USES_DATA_DIR;
        }
        VersionHeader {
            version_id: self.version_id(),
            mod_time: self.mod_time(),
            version_type: self.version_type(),
            flags,
        }
    }

    /// Build a journal entry from a `FileInfo`.
    pub fn from_fileinfo(fi: &FileInfo) -> Result<Self> {
        if fi.deleted {
            let mut meta_sys = fi.meta_sys.clone();
            if fi.free_version {
                meta_sys.insert(crate::META_FREE_VERSION.to_string(), Vec::new());
            }
            return Ok(Self::Delete(MetaDeleteMarker {
                version_id: fi.stored_version_id(),
                mod_time: fi.mod_time,
                meta_sys,
            }));
        }

        if !fi.erasure.is_valid() {
            return Err(Error::MetaParse(format!(
                "invalid erasure parameters for {}/{}",
                fi.volume, fi.name
            )));
        }

        let mut part_numbers = Vec::with_capacity(fi.parts.len());
        let mut part_etags = Vec::with_capacity(fi.parts.len());
        let mut part_sizes = Vec::with_capacity(fi.parts.len());
        let mut part_actual_sizes = Vec::with_capacity(fi.parts.len());
        for p in &fi.parts {
            part_numbers.push(p.number);
            part_etags.push(p.etag.clone().unwrap_or_default());
            part_sizes.push(p.size);
            part_actual_sizes.push(p.actual_size);
        }

        let mut part_checksums = Vec::with_capacity(fi.parts.len());
        let mut bitrot_algorithm = BitrotAlgorithm::default();
        for p in &fi.parts {
            match fi.erasure.checksum(p.number) {
                Some(ck) => {
                    bitrot_algorithm = ck.algorithm;
                    part_checksums.push(ck.hash.clone());
                }
                None => part_checksums.push(Vec::new()),
            }
        }

        let mut meta_sys = fi.meta_sys.clone();
        let mut meta_user = HashMap::with_capacity(fi.metadata.len());
        for (k, v) in &fi.metadata {
            if k.starts_with(crate::RESERVED_META_PREFIX) {
                meta_sys.insert(k.clone(), v.clone().into_bytes());
            } else {
                meta_user.insert(k.clone(), v.clone());
            }
        }
        if let Some(etag) = &fi.etag {
            meta_user.insert("etag".to_string(), etag.clone());
        }

        Ok(Self::Object(MetaObject {
            version_id: fi.stored_version_id(),
            data_dir: fi.data_dir.unwrap_or(Uuid::nil()),
            erasure_algorithm: fi.erasure.algorithm,
            erasure_m: fi.erasure.data_blocks,
            erasure_n: fi.erasure.parity_blocks,
            erasure_block_size: fi.erasure.block_size,
            erasure_index: fi.erasure.index,
            erasure_dist: fi.erasure.distribution.clone(),
            bitrot_algorithm,
            part_checksums,
            part_numbers,
            part_etags,
            part_sizes,
            part_actual_sizes,
            size: fi.size,
            mod_time: fi.mod_time,
            meta_sys,
            meta_user,
        }))
    }

    /// Project this entry into the common record type.
    #[must_use]
    pub fn to_fileinfo(&self, volume: &str, name: &str) -> FileInfo {
        match self {
            Self::Object(o) => {
                let mut parts = Vec::with_capacity(o.part_numbers.len());
                for (i, num) in o.part_numbers.iter().enumerate() {
                    parts.push(ObjectPartInfo {
                        number: *num,
                        size: o.part_sizes.get(i).copied().unwrap_or_default(),
                        actual_size: o
                            .part_actual_sizes
                            .get(i)
                            .copied()
                            .or_else(|| o.part_sizes.get(i).copied())
                            .unwrap_or_default(),
                        etag: o.part_etags.get(i).filter(|e| !e.is_empty()).cloned(),
                    });
                }
                let checksums = o
                    .part_numbers
                    .iter()
                    .enumerate()
                    .map(|(i, num)| ChecksumInfo {
                        part_number: *num,
                        algorithm: o.bitrot_algorithm,
                        hash: o.part_checksums.get(i).cloned().unwrap_or_default(),
                    })
                    .collect();

                let etag = o.meta_user.get("etag").cloned();
                let metadata = o
                    .meta_user
                    .iter()
                    .filter(|(k, _)| k.as_str() != "etag")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();

                FileInfo {
                    volume: volume.to_string(),
                    name: name.to_string(),
                    version_id: none_if_nil(o.version_id),
                    is_latest: false,
                    deleted: false,
                    data_dir: if o.uses_data_dir() {
                        Some(o.data_dir)
                    } else {
                        None
                    },
                    mod_time: o.mod_time,
                    size: o.size,
                    parts,
                    erasure: ErasureInfo {
                        algorithm: o.erasure_algorithm,
                        data_blocks: o.erasure_m,
                        parity_blocks: o.erasure_n,
                        block_size: o.erasure_block_size,
                        index: o.erasure_index,
                        distribution: o.erasure_dist.clone(),
                        checksums,
                    },
                    metadata,
                    meta_sys: o.meta_sys.clone(),
                    etag,
                    data: None,
                    num_versions: 0,
                    successor_mod_time: None,
                    free_version: false,
                }
            }
            Self::Delete(d) => FileInfo {
                volume: volume.to_string(),
                name: name.to_string(),
                version_id: none_if_nil(d.version_id),
                deleted: true,
                mod_time: d.mod_time,
                meta_sys: d.meta_sys.clone(),
                free_version: d.free_version(),
                ..FileInfo::new(volume, name)
            },
            Self::Legacy(l) => FileInfo {
                volume: volume.to_string(),
                name: name.to_string(),
                version_id: none_if_nil(l.version_id),
                data_dir: Some(l.data_dir),
                mod_time: l.mod_time,
                size: l.size,
                etag: l.etag.clone(),
                metadata: l.meta_user.clone(),
                ..FileInfo::new(volume, name)
            },
        }
    }
}

/// Lightweight per-version header for quick scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHeader {
    pub version_id: Uuid,
    pub mod_time: i64,
    pub version_type: VersionType,
    pub flags: u8,
}

impl VersionHeader {
    #[must_use]
    pub const fn free_version(&self) -> bool {
        self.flags & FLAG_FREE_VERSION != 0
    }

    #[must_use]
    pub const fn uses_data_dir(&self) -> bool {
        self.flags & FLAG_USES_DATA_DIR != 0
    }

    /// Sort key: mod-time descending, version id as tie breaker so all
    /// drives produce identical ordering.
    #[must_use]
    pub fn sorts_before(&self, other: &Self) -> bool {
        if self.mod_time != other.mod_time {
            return self.mod_time > other.mod_time;
        }
        self.version_id.as_bytes() > other.version_id.as_bytes()
    }
}

fn none_if_nil(id: Uuid) -> Option<Uuid> {
    if id.is_nil() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_fi() -> FileInfo {
        let mut fi = FileInfo::new("bucket", "key");
        fi.version_id = Some(Uuid::new_v4());
        fi.data_dir = Some(Uuid::new_v4());
        fi.mod_time = 1_700_000_000_000_000_000;
        fi.size = 42;
        fi.etag = Some("abc123".to_string());
        fi.parts.push(ObjectPartInfo {
            number: 1,
            size: 42,
            actual_size: 42,
            etag: None,
        });
        fi.erasure = ErasureInfo {
            algorithm: ErasureAlgo::ReedSolomon,
            data_blocks: 2,
            parity_blocks: 2,
            block_size: 1 << 20,
            index: 3,
            distribution: vec![3, 4, 1, 2],
            checksums: vec![ChecksumInfo {
                part_number: 1,
                algorithm: BitrotAlgorithm::HighwayHash256,
                hash: vec![7u8; 32],
            }],
        };
        fi.metadata
            .insert("content-type".to_string(), "text/plain".to_string());
        fi
    }

    #[test]
    fn test_fileinfo_roundtrip() {
        let fi = object_fi();
        let ver = Version::from_fileinfo(&fi).unwrap();
        assert!(ver.is_valid());
        let back = ver.to_fileinfo("bucket", "key");
        assert_eq!(back.version_id, fi.version_id);
        assert_eq!(back.data_dir, fi.data_dir);
        assert_eq!(back.size, fi.size);
        assert_eq!(back.etag, fi.etag);
        assert_eq!(back.erasure.index, 3);
        assert_eq!(back.erasure.checksums, fi.erasure.checksums);
        assert_eq!(back.metadata, fi.metadata);
    }

    #[test]
    fn test_delete_marker_roundtrip() {
        let mut fi = FileInfo::new("bucket", "key");
        fi.deleted = true;
        fi.version_id = Some(Uuid::new_v4());
        fi.mod_time = 12345;
        let ver = Version::from_fileinfo(&fi).unwrap();
        assert_eq!(ver.version_type(), VersionType::Delete);
        assert!(!ver.free_version());
        let back = ver.to_fileinfo("bucket", "key");
        assert!(back.deleted);
        assert_eq!(back.version_id, fi.version_id);
    }

    #[test]
    fn test_free_version_flag() {
        let mut fi = FileInfo::new("bucket", "key");
        fi.deleted = true;
        fi.free_version = true;
        fi.version_id = Some(Uuid::new_v4());
        fi.mod_time = 1;
        let ver = Version::from_fileinfo(&fi).unwrap();
        assert!(ver.free_version());
        assert!(ver.header().free_version());
        assert!(!ver.header().uses_data_dir());
    }

    #[test]
    fn test_header_ordering() {
        let a = VersionHeader {
            version_id: Uuid::new_v4(),
            mod_time: 10,
            version_type: VersionType::Object,
            flags: 0,
        };
        let b = VersionHeader {
            version_id: Uuid::new_v4(),
            mod_time: 5,
            version_type: VersionType::Object,
            flags: 0,
        };
        assert!(a.sorts_before(&b));
        assert!(!b.sorts_before(&a));
    }
}
