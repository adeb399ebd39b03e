//! `xl.meta` framing, loading and mutation
//!
//! The file is rewritten wholesale on any mutation; commit happens via
//! the drive layer's temp-and-rename, so readers either see the old or
//! the new file. A CRC mismatch marks this drive's copy corrupt and
//! excludes it from quorum.

use crate::fileinfo::FileInfo;
use crate::inline::InlineData;
use crate::version::{Version, VersionHeader};
use std::io::Cursor;
use uuid::Uuid;
use vaultio_common::{Error, Result};
use xxhash_rust::xxh64::xxh64;

/// Magic prefix of every `xl.meta`.
pub const XL_MAGIC: [u8; 4] = *b"XL2 ";
/// Current major version; a higher major on disk is unreadable.
pub const XL_MAJOR: u16 = 1;
/// Current minor version written; all lower minors remain readable.
pub const XL_MINOR: u16 = 3;

const HEADER_VERSION: u8 = 1;
const META_VERSION: u8 = 1;

/// One version entry: decoded header plus the raw serialized record,
/// decoded lazily so listings touch only headers.
#[derive(Clone, Debug, PartialEq)]
pub struct ShallowVersion {
    pub header: VersionHeader,
    pub meta: Vec<u8>,
}

impl ShallowVersion {
    /// Serialize a full version record into its shallow form.
    pub fn from_version(version: &Version) -> Result<Self> {
        let meta =
            rmp_serde::to_vec_named(version).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self {
            header: version.header(),
            meta,
        })
    }

    /// Decode the full version record.
    pub fn decode(&self) -> Result<Version> {
        rmp_serde::from_slice(&self.meta).map_err(|e| Error::MetaParse(e.to_string()))
    }
}

/// In-memory representation of one `xl.meta` file.
#[derive(Clone, Debug, Default)]
pub struct FileMeta {
    /// Versions sorted by mod-time descending; index 0 is the latest.
    pub versions: Vec<ShallowVersion>,
    /// Trailing inline-data region.
    pub data: InlineData,
}

/// Quick check whether a buffer carries a readable `xl.meta` frame.
#[must_use]
pub fn is_xl2_format(buf: &[u8]) -> bool {
    check_frame(buf).is_ok()
}

fn check_frame(buf: &[u8]) -> Result<(&[u8], u16, u16)> {
    if buf.len() <= 8 {
        return Err(Error::MetaParse("xl.meta: no data".into()));
    }
    if buf[..4] != XL_MAGIC {
        return Err(Error::MetaParse("xl.meta: unknown header".into()));
    }
    let (major, minor) = if &buf[4..8] == b"1   " {
        (1, 0)
    } else {
        (
            u16::from_le_bytes([buf[4], buf[5]]),
            u16::from_le_bytes([buf[6], buf[7]]),
        )
    };
    if major > XL_MAJOR {
        return Err(Error::MetaUnknownVersion { major, minor });
    }
    Ok((&buf[8..], major, minor))
}

impl FileMeta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized `xl.meta`, verifying the CRC for minor >= 2.
    pub fn load(buf: &[u8]) -> Result<Self> {
        let (payload, _major, minor) = check_frame(buf)?;

        match minor {
            0 => {
                let versions: Vec<Version> =
                    rmp_serde::from_slice(payload).map_err(|e| Error::MetaParse(e.to_string()))?;
                let mut meta = Self::from_versions(versions)?;
                meta.sort_versions();
                Ok(meta)
            }
            1 | 2 => {
                let mut rd = Cursor::new(payload);
                let body = read_bin(&mut rd, payload)?;
                if minor >= 2 {
                    verify_crc(&mut rd, &body)?;
                }
                let rest = &payload[rd.position() as usize..];
                let versions: Vec<Version> =
                    rmp_serde::from_slice(&body).map_err(|e| Error::MetaParse(e.to_string()))?;
                let mut meta = Self::from_versions(versions)?;
                meta.sort_versions();
                meta.data = InlineData::parse(rest);
                Ok(meta)
            }
            3 => {
                let mut rd = Cursor::new(payload);
                let body = read_bin(&mut rd, payload)?;
                verify_crc(&mut rd, &body)?;
                let rest = &payload[rd.position() as usize..];
                let mut meta = Self::load_indexed(&body)?;
                meta.data = InlineData::parse(rest);
                Ok(meta)
            }
            _ => Err(Error::MetaUnknownVersion {
                major: XL_MAJOR,
                minor,
            }),
        }
    }

    fn from_versions(versions: Vec<Version>) -> Result<Self> {
        let mut shallow = Vec::with_capacity(versions.len());
        for v in &versions {
            if !v.is_valid() {
                return Err(Error::MetaParse("invalid version entry".into()));
            }
            shallow.push(ShallowVersion::from_version(v)?);
        }
        Ok(Self {
            versions: shallow,
            data: InlineData::new(),
        })
    }

    fn load_indexed(body: &[u8]) -> Result<Self> {
        let mut rd = Cursor::new(body);
        let header_version: u8 =
            rmp::decode::read_int(&mut rd).map_err(|e| Error::MetaParse(e.to_string()))?;
        let meta_version: u8 =
            rmp::decode::read_int(&mut rd).map_err(|e| Error::MetaParse(e.to_string()))?;
        if header_version > HEADER_VERSION || meta_version > META_VERSION {
            return Err(Error::MetaParse(format!(
                "unknown index versions {header_version}/{meta_version}"
            )));
        }
        let count: u32 =
            rmp::decode::read_int(&mut rd).map_err(|e| Error::MetaParse(e.to_string()))?;

        let mut versions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let header_bytes = read_bin(&mut rd, body)?;
            let meta_bytes = read_bin(&mut rd, body)?;
            let header: VersionHeader = rmp_serde::from_slice(&header_bytes)
                .map_err(|e| Error::MetaParse(e.to_string()))?;
            versions.push(ShallowVersion {
                header,
                meta: meta_bytes,
            });
        }
        Ok(Self {
            versions,
            data: InlineData::new(),
        })
    }

    /// Serialize in the current (indexed, CRC-protected) layout.
    pub fn append_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut body = Vec::with_capacity(64 + self.versions.len() * 128);
        rmp::encode::write_uint(&mut body, u64::from(HEADER_VERSION))
            .map_err(|e| Error::Serialization(e.to_string()))?;
        rmp::encode::write_uint(&mut body, u64::from(META_VERSION))
            .map_err(|e| Error::Serialization(e.to_string()))?;
        rmp::encode::write_uint(&mut body, self.versions.len() as u64)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        for ver in &self.versions {
            let header_bytes = rmp_serde::to_vec(&ver.header)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            rmp::encode::write_bin(&mut body, &header_bytes)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            rmp::encode::write_bin(&mut body, &ver.meta)
                .map_err(|e| Error::Serialization(e.to_string()))?;
        }

        buf.extend_from_slice(&XL_MAGIC);
        buf.extend_from_slice(&XL_MAJOR.to_le_bytes());
        buf.extend_from_slice(&XL_MINOR.to_le_bytes());
        rmp::encode::write_bin(buf, &body).map_err(|e| Error::Serialization(e.to_string()))?;
        rmp::encode::write_u32(buf, xxh64(&body, 0) as u32)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.data.append_to(buf)?;
        Ok(())
    }

    /// Serialize into a fresh buffer.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256 + self.versions.len() * 256);
        self.append_to(&mut buf)?;
        Ok(buf)
    }

    fn sort_versions(&mut self) {
        self.versions.sort_by(|a, b| {
            b.header
                .mod_time
                .cmp(&a.header.mod_time)
                .then_with(|| b.header.version_id.as_bytes().cmp(a.header.version_id.as_bytes()))
        });
    }

    /// Mod-time of the newest version, 0 when empty.
    #[must_use]
    pub fn latest_mod_time(&self) -> i64 {
        self.versions.first().map_or(0, |v| v.header.mod_time)
    }

    /// Locate a version by stored id (nil UUID = "null" version).
    pub fn find_version(&self, version_id: Uuid) -> Result<(usize, Version)> {
        for (idx, ver) in self.versions.iter().enumerate() {
            if ver.header.version_id == version_id {
                return Ok((idx, ver.decode()?));
            }
        }
        Err(Error::FileVersionNotFound)
    }

    /// Add a version, replacing any existing entry with the same id.
    ///
    /// At most one version per id may exist in one `xl.meta`. Inline
    /// bytes carried on `fi.data` land in the inline region.
    pub fn add_version(&mut self, fi: &FileInfo) -> Result<()> {
        let version = Version::from_fileinfo(fi)?;
        let vid = fi.stored_version_id();
        let shallow = ShallowVersion::from_version(&version)?;

        self.versions.retain(|v| v.header.version_id != vid);
        let at = self
            .versions
            .iter()
            .position(|v| shallow.header.sorts_before(&v.header))
            .unwrap_or(self.versions.len());
        self.versions.insert(at, shallow);

        if let Some(data) = &fi.data {
            if fi.inline_data() {
                self.data.replace(vid, data.clone());
            }
        }
        Ok(())
    }

    /// Update a version's metadata in place. Erasure parameters, parts
    /// and mod-time are immutable through this path.
    pub fn update_version(&mut self, fi: &FileInfo) -> Result<()> {
        let vid = fi.stored_version_id();
        let (idx, version) = self.find_version(vid)?;
        let updated = match version {
            Version::Object(mut obj) => {
                obj.meta_sys = fi.meta_sys.clone();
                obj.meta_user = fi
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if let Some(etag) = &fi.etag {
                    obj.meta_user.insert("etag".to_string(), etag.clone());
                }
                Version::Object(obj)
            }
            Version::Delete(mut marker) => {
                marker.meta_sys = fi.meta_sys.clone();
                Version::Delete(marker)
            }
            Version::Legacy(_) => return Err(Error::MethodNotAllowed),
        };
        self.versions[idx] = ShallowVersion::from_version(&updated)?;
        Ok(())
    }

    /// Delete a version by id.
    ///
    /// Returns the data directory to purge (when no other version shares
    /// it) and whether the object is now empty. A delete marker whose
    /// replication state is still updating is rewritten in place instead
    /// of being dropped. Deleting a transitioned object version leaves a
    /// free version behind to schedule remote cleanup.
    pub fn delete_version(&mut self, fi: &FileInfo) -> Result<(Option<Uuid>, bool)> {
        let vid = fi.stored_version_id();
        let (idx, version) = match self.find_version(vid) {
            Ok(found) => found,
            // Deleting a version that does not exist yet with a marker
            // record appends the marker: the delete of a live object
            // under versioning.
            Err(Error::FileVersionNotFound) if fi.deleted => {
                self.add_version(fi)?;
                return Ok((None, false));
            }
            Err(e) => return Err(e),
        };

        if let Version::Delete(marker) = &version {
            let updating = fi
                .meta_sys
                .get(crate::META_REPLICATION_STATUS)
                .is_some_and(|v| !v.is_empty());
            if fi.deleted && updating {
                let mut next = marker.clone();
                next.meta_sys = fi.meta_sys.clone();
                self.versions[idx] = ShallowVersion::from_version(&Version::Delete(next))?;
                return Ok((None, false));
            }
        }

        self.versions.remove(idx);

        let mut purge = None;
        if let Version::Object(obj) = &version {
            self.data.remove(obj.version_id);
            if obj.uses_data_dir() && self.shared_data_dir_count(obj.version_id, obj.data_dir) == 0
            {
                purge = Some(obj.data_dir);
            }
            if obj.meta_sys.contains_key(crate::META_TRANSITION_TIER) {
                self.add_free_version(obj)?;
            }
        }

        Ok((purge, self.versions.is_empty()))
    }

    fn add_free_version(&mut self, obj: &crate::version::MetaObject) -> Result<()> {
        let mut meta_sys = std::collections::HashMap::new();
        meta_sys.insert(crate::META_FREE_VERSION.to_string(), Vec::new());
        for key in [
            crate::META_TRANSITION_TIER,
            crate::META_TRANSITIONED_OBJECT,
        ] {
            if let Some(v) = obj.meta_sys.get(key) {
                meta_sys.insert(key.to_string(), v.clone());
            }
        }
        let marker = crate::version::MetaDeleteMarker {
            version_id: Uuid::new_v4(),
            mod_time: obj.mod_time,
            meta_sys,
        };
        let shallow = ShallowVersion::from_version(&Version::Delete(marker))?;
        let at = self
            .versions
            .iter()
            .position(|v| shallow.header.sorts_before(&v.header))
            .unwrap_or(self.versions.len());
        self.versions.insert(at, shallow);
        Ok(())
    }

    /// Count versions other than `version_id` that reference `data_dir`.
    #[must_use]
    pub fn shared_data_dir_count(&self, version_id: Uuid, data_dir: Uuid) -> usize {
        self.versions
            .iter()
            .filter(|v| v.header.version_id != version_id && v.header.uses_data_dir())
            .filter_map(|v| v.decode().ok())
            .filter(|v| v.data_dir() == Some(data_dir))
            .count()
    }

    /// Project one version (latest when `version_id` is `None`) into a
    /// `FileInfo`. Free versions are skipped unless requested.
    pub fn into_fileinfo(
        &self,
        volume: &str,
        name: &str,
        version_id: Option<Uuid>,
        read_data: bool,
        incl_free_versions: bool,
    ) -> Result<FileInfo> {
        let visible: Vec<&ShallowVersion> = self
            .versions
            .iter()
            .filter(|v| incl_free_versions || !v.header.free_version())
            .collect();

        if visible.is_empty() {
            return Err(Error::FileNotFound);
        }

        let (pos, shallow) = match version_id {
            None => (0, visible[0]),
            Some(vid) => visible
                .iter()
                .enumerate()
                .find(|(_, v)| v.header.version_id == vid)
                .map(|(i, v)| (i, *v))
                .ok_or(Error::FileVersionNotFound)?,
        };

        let mut fi = shallow.decode()?.to_fileinfo(volume, name);
        fi.is_latest = pos == 0;
        fi.num_versions = visible.len();
        if pos > 0 {
            fi.successor_mod_time = Some(visible[pos - 1].header.mod_time);
        }
        if read_data && fi.inline_data() {
            fi.data = self
                .data
                .find(shallow.header.version_id)
                .map(|d| d.to_vec());
        }
        Ok(fi)
    }

    /// All visible versions, newest first, with `is_latest` set on the
    /// head entry.
    pub fn list_versions(&self, volume: &str, name: &str) -> Result<Vec<FileInfo>> {
        let mut out = Vec::with_capacity(self.versions.len());
        let total = self
            .versions
            .iter()
            .filter(|v| !v.header.free_version())
            .count();
        for shallow in self.versions.iter().filter(|v| !v.header.free_version()) {
            let mut fi = shallow.decode()?.to_fileinfo(volume, name);
            fi.is_latest = out.is_empty();
            fi.num_versions = total;
            out.push(fi);
        }
        Ok(out)
    }

    /// Free versions awaiting asynchronous tier cleanup.
    pub fn list_free_versions(&self, volume: &str, name: &str) -> Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        for shallow in self.versions.iter().filter(|v| v.header.free_version()) {
            let mut fi = shallow.decode()?.to_fileinfo(volume, name);
            fi.free_version = true;
            out.push(fi);
        }
        Ok(out)
    }
}

fn verify_crc(rd: &mut Cursor<&[u8]>, body: &[u8]) -> Result<()> {
    let want: u32 = rmp::decode::read_int(rd).map_err(|e| Error::MetaParse(e.to_string()))?;
    let got = xxh64(body, 0) as u32;
    if want != got {
        return Err(Error::MetaCrcMismatch { want, got });
    }
    Ok(())
}

fn read_bin(rd: &mut Cursor<&[u8]>, buf: &[u8]) -> Result<Vec<u8>> {
    let len = rmp::decode::read_bin_len(rd).map_err(|e| Error::MetaParse(e.to_string()))? as usize;
    let pos = rd.position() as usize;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::MetaParse("truncated bin field".into()))?;
    rd.set_position(end as u64);
    Ok(buf[pos..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileinfo::{ChecksumInfo, ErasureAlgo, ErasureInfo, ObjectPartInfo};
    use vaultio_erasure::BitrotAlgorithm;

    fn object_fi(name: &str, mod_time: i64) -> FileInfo {
        let mut fi = FileInfo::new("bucket", name);
        fi.version_id = Some(Uuid::new_v4());
        fi.data_dir = Some(Uuid::new_v4());
        fi.mod_time = mod_time;
        fi.size = 1024;
        fi.etag = Some("etag-1".into());
        fi.parts.push(ObjectPartInfo {
            number: 1,
            size: 1024,
            actual_size: 1024,
            etag: None,
        });
        fi.erasure = ErasureInfo {
            algorithm: ErasureAlgo::ReedSolomon,
            data_blocks: 2,
            parity_blocks: 2,
            block_size: 1 << 20,
            index: 1,
            distribution: vec![1, 2, 3, 4],
            checksums: vec![ChecksumInfo {
                part_number: 1,
                algorithm: BitrotAlgorithm::HighwayHash256,
                hash: vec![1u8; 32],
            }],
        };
        fi
    }

    #[test]
    fn test_marshal_load_roundtrip() {
        let mut meta = FileMeta::new();
        meta.add_version(&object_fi("obj", 100)).unwrap();
        meta.add_version(&object_fi("obj", 200)).unwrap();

        let buf = meta.marshal().unwrap();
        assert!(is_xl2_format(&buf));

        let loaded = FileMeta::load(&buf).unwrap();
        assert_eq!(loaded.versions.len(), 2);
        assert_eq!(loaded.versions[0].header, meta.versions[0].header);
        assert_eq!(loaded.versions[1].meta, meta.versions[1].meta);
        // Newest first.
        assert_eq!(loaded.latest_mod_time(), 200);
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut meta = FileMeta::new();
        meta.add_version(&object_fi("obj", 100)).unwrap();
        let mut buf = meta.marshal().unwrap();
        // Flip one bit inside the body.
        let at = buf.len() / 2;
        buf[at] ^= 0x40;
        let err = FileMeta::load(&buf).unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {err:?}");
    }

    #[test]
    fn test_version_id_uniqueness() {
        let mut meta = FileMeta::new();
        let mut fi = object_fi("obj", 100);
        meta.add_version(&fi).unwrap();
        fi.mod_time = 300;
        meta.add_version(&fi).unwrap();
        assert_eq!(meta.versions.len(), 1);
        assert_eq!(meta.latest_mod_time(), 300);
    }

    #[test]
    fn test_delete_version_returns_data_dir() {
        let mut meta = FileMeta::new();
        let fi = object_fi("obj", 100);
        meta.add_version(&fi).unwrap();

        let (purge, empty) = meta.delete_version(&fi).unwrap();
        assert_eq!(purge, fi.data_dir);
        assert!(empty);
    }

    #[test]
    fn test_delete_version_shared_data_dir() {
        let mut meta = FileMeta::new();
        let mut a = object_fi("obj", 100);
        a.set_inline_data();
        a.data = Some(vec![1, 2, 3]);
        let shared_dir = a.data_dir;

        let mut b = object_fi("obj", 200);
        b.set_inline_data();
        b.data_dir = shared_dir;
        b.data = Some(vec![4, 5, 6]);

        meta.add_version(&a).unwrap();
        meta.add_version(&b).unwrap();

        // Inline versions do not own the data dir, so nothing is purged.
        let (purge, empty) = meta.delete_version(&a).unwrap();
        assert_eq!(purge, None);
        assert!(!empty);
    }

    #[test]
    fn test_into_fileinfo_latest_and_by_id() {
        let mut meta = FileMeta::new();
        let old = object_fi("obj", 100);
        let new = object_fi("obj", 200);
        meta.add_version(&old).unwrap();
        meta.add_version(&new).unwrap();

        let latest = meta
            .into_fileinfo("bucket", "obj", None, false, false)
            .unwrap();
        assert_eq!(latest.version_id, new.version_id);
        assert!(latest.is_latest);
        assert_eq!(latest.num_versions, 2);

        let specific = meta
            .into_fileinfo("bucket", "obj", old.version_id, false, false)
            .unwrap();
        assert!(!specific.is_latest);
        assert_eq!(specific.successor_mod_time, Some(200));
    }

    #[test]
    fn test_free_versions_hidden() {
        let mut meta = FileMeta::new();
        let mut obj = object_fi("obj", 100);
        obj.meta_sys.insert(
            crate::META_TRANSITION_TIER.to_string(),
            b"GLACIER".to_vec(),
        );
        meta.add_version(&obj).unwrap();
        meta.delete_version(&obj).unwrap();

        // The free version is present but invisible to listings.
        assert_eq!(meta.versions.len(), 1);
        assert!(meta.list_versions("bucket", "obj").unwrap().is_empty());
        assert_eq!(meta.list_free_versions("bucket", "obj").unwrap().len(), 1);
        assert!(meta
            .into_fileinfo("bucket", "obj", None, false, false)
            .is_err());
    }

    #[test]
    fn test_inline_data_follows_version() {
        let mut meta = FileMeta::new();
        let mut fi = object_fi("obj", 100);
        fi.set_inline_data();
        fi.data = Some(vec![0xAB; 64]);
        meta.add_version(&fi).unwrap();

        let buf = meta.marshal().unwrap();
        let loaded = FileMeta::load(&buf).unwrap();
        let got = loaded
            .into_fileinfo("bucket", "obj", None, true, false)
            .unwrap();
        assert_eq!(got.data.as_deref(), Some(&[0xAB; 64][..]));
    }

    #[test]
    fn test_legacy_version_preserved() {
        use crate::version::{MetaLegacyObject, Version, VersionType};

        let legacy = Version::Legacy(MetaLegacyObject {
            version_id: Uuid::nil(),
            data_dir: Uuid::new_v4(),
            size: 77,
            mod_time: 10,
            etag: Some("legacy-etag".into()),
            meta_user: Default::default(),
        });
        let mut meta = FileMeta::new();
        meta.versions
            .push(ShallowVersion::from_version(&legacy).unwrap());

        let buf = meta.marshal().unwrap();
        let loaded = FileMeta::load(&buf).unwrap();
        assert_eq!(
            loaded.versions[0].header.version_type,
            VersionType::Legacy
        );
        let fi = loaded
            .into_fileinfo("bucket", "obj", None, false, false)
            .unwrap();
        assert_eq!(fi.size, 77);
        assert_eq!(fi.etag.as_deref(), Some("legacy-etag"));

        // A newer write sorts above the preserved legacy entry.
        let newer = object_fi("obj", 20);
        let mut replaced = loaded.clone();
        replaced.add_version(&newer).unwrap();
        assert_eq!(replaced.versions.len(), 2);
        assert_eq!(replaced.latest_mod_time(), 20);
    }

    #[test]
    fn test_replication_pending_marker_rewritten() {
        let mut meta = FileMeta::new();
        let mut marker = FileInfo::new("bucket", "obj");
        marker.deleted = true;
        marker.version_id = Some(Uuid::new_v4());
        marker.mod_time = 500;
        meta.add_version(&marker).unwrap();

        marker
            .meta_sys
            .insert(crate::META_REPLICATION_STATUS.to_string(), b"PENDING".to_vec());
        let (purge, empty) = meta.delete_version(&marker).unwrap();
        assert_eq!(purge, None);
        assert!(!empty);
        assert_eq!(meta.versions.len(), 1);
    }
}
