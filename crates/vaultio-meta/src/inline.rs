//! Inline-data region of `xl.meta`
//!
//! Small objects store each drive's shard directly inside that drive's
//! `xl.meta`, keyed by version id, in a trailing msgpack map. Replacing
//! one version's bytes never disturbs another version's entry.

use std::io::Cursor;
use uuid::Uuid;
use vaultio_common::{Error, Result};

/// The trailing inline-data region: version id -> shard bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineData {
    entries: Vec<(String, Vec<u8>)>,
}

impl InlineData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn key(version_id: Uuid) -> String {
        version_id.to_string()
    }

    /// Fetch the inline bytes for a version.
    #[must_use]
    pub fn find(&self, version_id: Uuid) -> Option<&[u8]> {
        let key = Self::key(version_id);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Insert or replace one version's bytes.
    pub fn replace(&mut self, version_id: Uuid, data: Vec<u8>) {
        let key = Self::key(version_id);
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = data;
        } else {
            self.entries.push((key, data));
        }
    }

    /// Remove one version's bytes; absent keys are a no-op.
    pub fn remove(&mut self, version_id: Uuid) {
        let key = Self::key(version_id);
        self.entries.retain(|(k, _)| *k != key);
    }

    /// Drop entries whose version no longer exists.
    pub fn retain_versions(&mut self, live: &[Uuid]) {
        let keys: Vec<String> = live.iter().map(|v| Self::key(*v)).collect();
        self.entries.retain(|(k, _)| keys.contains(k));
    }

    /// Serialize as a msgpack map; empty regions serialize to nothing.
    pub fn append_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        rmp::encode::write_map_len(buf, self.entries.len() as u32)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        for (k, v) in &self.entries {
            rmp::encode::write_str(buf, k).map_err(|e| Error::Serialization(e.to_string()))?;
            rmp::encode::write_bin(buf, v).map_err(|e| Error::Serialization(e.to_string()))?;
        }
        Ok(())
    }

    /// Parse the trailing region. An empty buffer is an empty region; a
    /// malformed region is dropped rather than poisoning the metadata,
    /// since part files remain the fallback source.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Self {
        match Self::try_parse(buf) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!("discarding unparsable inline data region: {err}");
                Self::new()
            }
        }
    }

    fn try_parse(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Ok(Self::new());
        }
        let mut rd = Cursor::new(buf);
        let len = rmp::decode::read_map_len(&mut rd)
            .map_err(|e| Error::MetaParse(e.to_string()))? as usize;
        let mut entries = Vec::with_capacity(len);
        for _ in 0..len {
            let key = read_str(&mut rd, buf)?;
            let val = read_bin(&mut rd, buf)?;
            entries.push((key, val));
        }
        Ok(Self { entries })
    }
}

fn read_str(rd: &mut Cursor<&[u8]>, buf: &[u8]) -> Result<String> {
    let len = rmp::decode::read_str_len(rd).map_err(|e| Error::MetaParse(e.to_string()))? as usize;
    let pos = rd.position() as usize;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::MetaParse("truncated inline key".into()))?;
    rd.set_position(end as u64);
    String::from_utf8(buf[pos..end].to_vec()).map_err(|e| Error::MetaParse(e.to_string()))
}

fn read_bin(rd: &mut Cursor<&[u8]>, buf: &[u8]) -> Result<Vec<u8>> {
    let len = rmp::decode::read_bin_len(rd).map_err(|e| Error::MetaParse(e.to_string()))? as usize;
    let pos = rd.position() as usize;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::MetaParse("truncated inline value".into()))?;
    rd.set_position(end as u64);
    Ok(buf[pos..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();
        let mut data = InlineData::new();
        data.replace(v1, vec![1, 2, 3]);
        data.replace(v2, vec![9; 100]);

        let mut buf = Vec::new();
        data.append_to(&mut buf).unwrap();
        let parsed = InlineData::parse(&buf);
        assert_eq!(parsed, data);
        assert_eq!(parsed.find(v1), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_replace_preserves_siblings() {
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();
        let mut data = InlineData::new();
        data.replace(v1, vec![1]);
        data.replace(v2, vec![2]);
        data.replace(v1, vec![7, 7]);
        assert_eq!(data.find(v1), Some(&[7u8, 7][..]));
        assert_eq!(data.find(v2), Some(&[2u8][..]));
    }

    #[test]
    fn test_malformed_region_dropped() {
        let parsed = InlineData::parse(&[0xFF, 0x00, 0x01]);
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_remove_and_retain() {
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();
        let mut data = InlineData::new();
        data.replace(v1, vec![1]);
        data.replace(v2, vec![2]);
        data.remove(v1);
        assert!(data.find(v1).is_none());
        data.retain_versions(&[]);
        assert!(data.is_empty());
    }
}
