//! Shard I/O: streaming encode on write, verified gather-and-decode on
//! read, full reconstruction for heal.
//!
//! Shards are addressed in *shard order*: index `i` of every slice here
//! is erasure shard `i`, and the caller supplies drives shuffled into
//! that order via the object's distribution permutation.

use crate::quorum::reduce_quorum_errs;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;
use vaultio_common::{Error, Result, RESERVED_BUCKET};
use vaultio_disk::Drive;
use vaultio_erasure::{BitrotAlgorithm, BitrotHasher, BitrotVerifier, Erasure};
use vaultio_meta::FileInfo;

/// Outcome of streaming one part's shards onto the drives.
pub struct WriteOutcome {
    /// Bitrot digest per shard; `None` where the drive failed.
    pub checksums: Vec<Option<Vec<u8>>>,
    /// Per-shard write error, aligned with the drive slice.
    pub errors: Vec<Option<Error>>,
    /// Bytes consumed from the source.
    pub total_size: u64,
}

/// Read the next block, retrying short reads until EOF.
async fn read_block(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream `reader` through the erasure encoder, appending each block's
/// shards to `tmp_path` (`part.N` under the staging data dir) on each
/// drive while hashing per shard. Fails early when fewer than
/// `write_quorum` drives remain writable.
pub async fn write_shards(
    drives: &[Option<Arc<dyn Drive>>],
    tmp_path: &str,
    erasure: &Erasure,
    algo: BitrotAlgorithm,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    write_quorum: usize,
) -> Result<WriteOutcome> {
    let total_shards = erasure.total_blocks();
    debug_assert_eq!(drives.len(), total_shards);

    let mut hashers: Vec<Option<BitrotHasher>> =
        (0..total_shards).map(|_| Some(algo.hasher())).collect();
    let mut errors: Vec<Option<Error>> = drives
        .iter()
        .map(|d| match d {
            Some(d) if d.is_online() => None,
            _ => Some(Error::DriveOffline),
        })
        .collect();

    let mut block = vec![0u8; erasure.block_size()];
    let mut total_size = 0u64;
    let mut first = true;

    loop {
        let n = read_block(reader, &mut block).await.map_err(Error::DriveIo)?;
        if n == 0 && !first {
            break;
        }
        first = false;
        total_size += n as u64;

        let shards = erasure.encode_data(&block[..n])?;

        let writes = join_all(drives.iter().enumerate().map(|(i, drive)| {
            let shard = Bytes::copy_from_slice(&shards[i]);
            let failed = errors[i].is_some();
            async move {
                match drive {
                    Some(drive) if !failed => {
                        drive.append_file(RESERVED_BUCKET, tmp_path, shard).await
                    }
                    _ => Err(Error::DriveOffline),
                }
            }
        }))
        .await;

        for (i, res) in writes.into_iter().enumerate() {
            match res {
                Ok(()) => {
                    if let Some(h) = hashers[i].as_mut() {
                        h.update(&shards[i]);
                    }
                }
                Err(e) => {
                    if errors[i].is_none() {
                        warn!(shard = i, error = %e, "shard write failed");
                        errors[i] = Some(e);
                        hashers[i] = None;
                    }
                }
            }
        }

        let writable = errors.iter().filter(|e| e.is_none()).count();
        if writable < write_quorum {
            return Err(reduce_quorum_errs(
                &errors,
                write_quorum,
                Error::WriteQuorum {
                    have: writable,
                    want: write_quorum,
                },
            )
            .unwrap_or(Error::WriteQuorum {
                have: writable,
                want: write_quorum,
            }));
        }

        if n < erasure.block_size() {
            break;
        }
    }

    let checksums = hashers
        .into_iter()
        .map(|h| h.map(BitrotHasher::finalize))
        .collect();

    Ok(WriteOutcome {
        checksums,
        errors,
        total_size,
    })
}

/// Encode a fully-buffered small object into per-shard byte vectors
/// with their digests (the inline path: shards land in `xl.meta`).
pub fn encode_inline(
    erasure: &Erasure,
    algo: BitrotAlgorithm,
    data: &[u8],
) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let shards = erasure.encode_data(data)?;
    let checksums = shards
        .iter()
        .map(|shard| {
            let mut h = algo.hasher();
            h.update(shard);
            h.finalize()
        })
        .collect();
    Ok((shards, checksums))
}

/// Gather one part's shard files (verified) in shard order. Inline
/// versions are served from each drive's metadata copy. Failed or
/// corrupt shards come back as `None`.
pub async fn gather_shards(
    drives: &[Option<Arc<dyn Drive>>],
    metas: &[Option<FileInfo>],
    bucket: &str,
    object: &str,
    part_number: usize,
    shard_len: usize,
) -> Vec<Option<Vec<u8>>> {
    join_all(drives.iter().zip(metas.iter()).map(|(drive, meta)| async move {
        let fi = meta.as_ref()?;
        if fi.inline_data() {
            let data = fi.data.as_ref()?;
            let ck = fi.erasure.checksum(part_number)?;
            let verifier = BitrotVerifier::new(ck.algorithm, ck.hash.clone());
            if verifier.verify(data).is_err() {
                warn!(object, part_number, "inline shard failed bitrot verification");
                return None;
            }
            return Some(data.clone());
        }

        let drive = drive.as_ref()?;
        let dd = fi.data_dir?;
        let ck = fi.erasure.checksum(part_number)?;
        let verifier = BitrotVerifier::new(ck.algorithm, ck.hash.clone());
        let path = format!("{object}/{dd}/part.{part_number}");
        match drive
            .read_file_with_verify(bucket, &path, 0, shard_len as u64, &verifier)
            .await
        {
            Ok(buf) => Some(buf.to_vec()),
            Err(e) => {
                if e.is_corruption() {
                    warn!(
                        drive = %drive.endpoint(),
                        object, part_number,
                        "shard excluded after bitrot failure"
                    );
                }
                None
            }
        }
    }))
    .await
}

/// Decode one part's byte range from gathered shards into `writer`.
/// Decoding proceeds block by block; early writer errors stop the
/// remaining blocks.
pub async fn decode_range(
    erasure: &Erasure,
    shards: &[Option<Vec<u8>>],
    part_size: usize,
    part_offset: u64,
    length: u64,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<u64> {
    let available = shards.iter().filter(|s| s.is_some()).count();
    if available < erasure.data_blocks() {
        return Err(Error::InsufficientShards {
            have: available,
            need: erasure.data_blocks(),
        });
    }

    let block_size = erasure.block_size();
    let shard_size = erasure.shard_size();
    let end = (part_offset + length).min(part_size as u64) as usize;
    let mut written = 0u64;
    let mut cursor = part_offset as usize;

    while cursor < end {
        let block_idx = cursor / block_size;
        let block_start = block_idx * block_size;
        let block_len = block_size.min(part_size - block_start);
        let stripe_len = block_len.div_ceil(erasure.data_blocks());
        let stripe_off = block_idx * shard_size;

        let mut stripe: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|s| {
                s.as_ref().and_then(|buf| {
                    buf.get(stripe_off..stripe_off + stripe_len).map(<[u8]>::to_vec)
                })
            })
            .collect();

        erasure.decode_data(&mut stripe)?;
        let block = erasure.join_block(&stripe, block_len);

        let window_start = cursor - block_start;
        let window_end = (end - block_start).min(block_len);
        writer
            .write_all(&block[window_start..window_end])
            .await
            .map_err(Error::DriveIo)?;
        written += (window_end - window_start) as u64;
        cursor = block_start + window_end;
    }

    writer.flush().await.map_err(Error::DriveIo)?;
    Ok(written)
}

/// Rebuild the complete shard set for one part, data and parity, from
/// any M healthy shards. Used by heal.
pub fn reconstruct_all(erasure: &Erasure, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
    erasure.reconstruct(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_inline_digests() {
        let erasure = Erasure::new(2, 2, 1 << 20).unwrap();
        let (shards, checksums) = encode_inline(
            &erasure,
            BitrotAlgorithm::HighwayHash256,
            &vec![7u8; 1000],
        )
        .unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(checksums.len(), 4);
        for (shard, sum) in shards.iter().zip(&checksums) {
            BitrotVerifier::new(BitrotAlgorithm::HighwayHash256, sum.clone())
                .verify(shard)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_decode_range_with_missing_shards() {
        let erasure = Erasure::new(2, 2, 1024).unwrap();
        // Three blocks: 1024 + 1024 + 500.
        let data: Vec<u8> = (0..2548u32).map(|i| (i % 251) as u8).collect();

        // Build shard files the way write_shards lays them out.
        let mut shard_files: Vec<Option<Vec<u8>>> = vec![Some(Vec::new()); 4];
        for chunk in data.chunks(1024) {
            let shards = erasure.encode_data(chunk).unwrap();
            for (i, s) in shards.iter().enumerate() {
                shard_files[i].as_mut().unwrap().extend_from_slice(s);
            }
        }
        shard_files[0] = None;
        shard_files[3] = None;

        let mut out = Vec::new();
        let n = decode_range(&erasure, &shard_files, data.len(), 0, data.len() as u64, &mut out)
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);

        // A mid-file range crossing a block boundary.
        let mut out = Vec::new();
        decode_range(&erasure, &shard_files, data.len(), 1000, 600, &mut out)
            .await
            .unwrap();
        assert_eq!(out, &data[1000..1600]);
    }

    #[tokio::test]
    async fn test_decode_range_insufficient() {
        let erasure = Erasure::new(2, 2, 1024).unwrap();
        let shards: Vec<Option<Vec<u8>>> = vec![Some(vec![0u8; 512]), None, None, None];
        let mut out = Vec::new();
        let err = decode_range(&erasure, &shards, 1024, 0, 1024, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientShards { .. }));
    }
}
