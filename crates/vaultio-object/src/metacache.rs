//! Listing cache: resolved listing pages spooled into the reserved
//! namespace as compressed, checksummed blocks keyed by a listing UUID.
//!
//! Purely an optimization layer; listings are correct without it, and
//! any decode failure simply sends the caller back to a live walk.
//! One writer per listing UUID, any number of readers.

use crate::store::ErasureSet;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use vaultio_common::{Error, Result, RESERVED_BUCKET, RESERVED_BUCKET_META};
use vaultio_disk::{DeleteOptions, MetaCacheEntry};

/// Entries per cache block.
const BLOCK_ENTRIES: usize = 500;

#[derive(Serialize, Deserialize)]
struct CachedEntry {
    name: String,
    metadata: Vec<u8>,
}

fn listing_dir(bucket: &str, listing_id: Uuid) -> String {
    format!("{RESERVED_BUCKET_META}/{bucket}/.metacache/{listing_id}")
}

/// Frame one block: crc32c over the compressed payload, then the
/// payload itself (which carries its own uncompressed length).
fn encode_block(entries: &[CachedEntry]) -> Result<Vec<u8>> {
    let raw = rmp_serde::to_vec(entries).map_err(|e| Error::Serialization(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);
    let mut out = Vec::with_capacity(4 + compressed.len());
    out.extend_from_slice(&crc32c::crc32c(&compressed).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decode_block(buf: &[u8]) -> Result<Vec<CachedEntry>> {
    if buf.len() < 4 {
        return Err(Error::FileCorrupt);
    }
    let want = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let compressed = &buf[4..];
    if crc32c::crc32c(compressed) != want {
        return Err(Error::FileCorrupt);
    }
    let raw = lz4_flex::decompress_size_prepended(compressed).map_err(|_| Error::FileCorrupt)?;
    rmp_serde::from_slice(&raw).map_err(|e| Error::MetaParse(e.to_string()))
}

impl ErasureSet {
    /// Spool a resolved listing into the cache namespace. Best-effort
    /// across drives; at least one copy must land.
    pub async fn save_listing(
        &self,
        bucket: &str,
        listing_id: Uuid,
        entries: &[MetaCacheEntry],
    ) -> Result<()> {
        let dir = listing_dir(bucket, listing_id);
        let cached: Vec<CachedEntry> = entries
            .iter()
            .map(|e| CachedEntry {
                name: e.name.clone(),
                metadata: e.metadata.to_vec(),
            })
            .collect();

        for (block_num, chunk) in cached.chunks(BLOCK_ENTRIES).enumerate() {
            let buf = Bytes::from(encode_block(chunk)?);
            let path = format!("{dir}/block.{block_num}");
            let mut wrote = 0usize;
            for drive in self.drives() {
                if drive
                    .write_all(RESERVED_BUCKET, &path, buf.clone())
                    .await
                    .is_ok()
                {
                    wrote += 1;
                }
            }
            if wrote == 0 {
                return Err(Error::WriteQuorum { have: 0, want: 1 });
            }
        }
        debug!(bucket, %listing_id, entries = cached.len(), "listing cached");
        Ok(())
    }

    /// Read a cached listing back. Any missing or corrupt block fails
    /// the whole read; the caller falls back to a live walk.
    pub async fn load_listing(
        &self,
        bucket: &str,
        listing_id: Uuid,
    ) -> Result<Vec<MetaCacheEntry>> {
        let dir = listing_dir(bucket, listing_id);
        let mut out = Vec::new();
        let mut block_num = 0usize;
        'blocks: loop {
            let path = format!("{dir}/block.{block_num}");
            let mut last_err = Error::FileNotFound;
            for drive in self.drives() {
                match drive.read_all(RESERVED_BUCKET, &path).await {
                    Ok(buf) => match decode_block(&buf) {
                        Ok(entries) => {
                            out.extend(entries.into_iter().map(|e| MetaCacheEntry {
                                name: e.name,
                                metadata: Bytes::from(e.metadata),
                            }));
                            block_num += 1;
                            continue 'blocks;
                        }
                        Err(e) => last_err = e,
                    },
                    Err(e) => last_err = e,
                }
            }
            // No drive produced this block: a missing trailing block is
            // the end of the listing, anything else fails the read.
            if last_err.is_not_found() && block_num > 0 {
                return Ok(out);
            }
            return Err(last_err);
        }
    }

    /// Drop a cached listing on every drive.
    pub async fn delete_listing(&self, bucket: &str, listing_id: Uuid) -> Result<()> {
        let dir = listing_dir(bucket, listing_id);
        for drive in self.drives() {
            let _ = drive
                .delete(
                    RESERVED_BUCKET,
                    &dir,
                    DeleteOptions {
                        recursive: true,
                        immediate: true,
                    },
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_roundtrip() {
        let entries: Vec<CachedEntry> = (0..10)
            .map(|i| CachedEntry {
                name: format!("obj-{i}"),
                metadata: vec![i as u8; 100],
            })
            .collect();
        let buf = encode_block(&entries).unwrap();
        let back = decode_block(&buf).unwrap();
        assert_eq!(back.len(), 10);
        assert_eq!(back[3].name, "obj-3");
        assert_eq!(back[3].metadata, vec![3u8; 100]);
    }

    #[test]
    fn test_block_crc_detects_corruption() {
        let entries = vec![CachedEntry {
            name: "x".into(),
            metadata: vec![1, 2, 3],
        }];
        let mut buf = encode_block(&entries).unwrap();
        let at = buf.len() - 1;
        buf[at] ^= 0x80;
        assert!(matches!(decode_block(&buf), Err(Error::FileCorrupt)));
    }
}
