//! Reed-Solomon encoder/decoder and shard-file geometry
//!
//! Shards are laid out systematically: indices `0..M` carry data, indices
//! `M..M+N` carry parity. A whole object is processed in `block_size`
//! units; every block contributes `shard_size()` bytes to each drive's
//! shard file, except the last block which contributes
//! `ceil(last_block_len / M)`.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;
use vaultio_common::{Error as CommonError, Result};

/// Errors specific to erasure coding operations
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient shards: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        match e {
            ErasureError::InsufficientShards { have, need } => {
                CommonError::InsufficientShards { have, need }
            }
            other => CommonError::Erasure(other.to_string()),
        }
    }
}

/// Erasure coding parameters plus the codec instance for one object.
pub struct Erasure {
    data_blocks: usize,
    parity_blocks: usize,
    block_size: usize,
    codec: ReedSolomon,
}

impl Erasure {
    /// Create a codec for M data + N parity blocks over `block_size`-byte
    /// stripes. Fails when `M + N` is outside `4..=256` or either count
    /// is zero.
    pub fn new(data_blocks: usize, parity_blocks: usize, block_size: usize) -> Result<Self> {
        if data_blocks == 0 || parity_blocks == 0 {
            return Err(
                ErasureError::InvalidConfig("data and parity blocks must be >= 1".into()).into(),
            );
        }
        if data_blocks + parity_blocks > 256 {
            return Err(ErasureError::InvalidConfig("total blocks must be <= 256".into()).into());
        }
        if block_size == 0 {
            return Err(ErasureError::InvalidConfig("block size must be > 0".into()).into());
        }
        let codec = ReedSolomon::new(data_blocks, parity_blocks)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            data_blocks,
            parity_blocks,
            block_size,
            codec,
        })
    }

    /// Number of data blocks (M)
    #[must_use]
    pub const fn data_blocks(&self) -> usize {
        self.data_blocks
    }

    /// Number of parity blocks (N)
    #[must_use]
    pub const fn parity_blocks(&self) -> usize {
        self.parity_blocks
    }

    /// Total shards per block (M + N)
    #[must_use]
    pub const fn total_blocks(&self) -> usize {
        self.data_blocks + self.parity_blocks
    }

    /// Stripe unit in bytes
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Encode one block of data (length <= `block_size`) into M + N
    /// equal-sized shards; the last data shard is zero-padded. Empty
    /// input yields M + N empty shards.
    pub fn encode_data(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Ok(vec![Vec::new(); self.total_blocks()]);
        }

        let per_shard = data.len().div_ceil(self.data_blocks);
        let mut shards = Vec::with_capacity(self.total_blocks());
        for i in 0..self.data_blocks {
            let start = (i * per_shard).min(data.len());
            let end = ((i + 1) * per_shard).min(data.len());
            let mut shard = data[start..end].to_vec();
            shard.resize(per_shard, 0);
            shards.push(shard);
        }
        for _ in 0..self.parity_blocks {
            shards.push(vec![0u8; per_shard]);
        }

        self.codec
            .encode(&mut shards)
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        Ok(shards)
    }

    /// Reconstruct missing **data** shards in place. Parity-only gaps are
    /// left untouched. Fully-present input (and input with no shard at
    /// all, which represents a zero-byte payload) short-circuits.
    pub fn decode_data(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing == 0 || missing == shards.len() {
            return Ok(());
        }
        let have = shards.len() - missing;
        if have < self.data_blocks {
            return Err(ErasureError::InsufficientShards {
                have,
                need: self.data_blocks,
            }
            .into());
        }
        self.codec
            .reconstruct_data(shards)
            .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
        Ok(())
    }

    /// Reconstruct **all** missing shards, data and parity. Used by heal
    /// to rebuild a drive's shard regardless of its index.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing == 0 {
            return Ok(());
        }
        let have = shards.len() - missing;
        if have < self.data_blocks {
            return Err(ErasureError::InsufficientShards {
                have,
                need: self.data_blocks,
            }
            .into());
        }
        self.codec
            .reconstruct(shards)
            .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
        Ok(())
    }

    /// Concatenate the data shards of one decoded block and truncate to
    /// the block's original length.
    #[must_use]
    pub fn join_block(&self, shards: &[Option<Vec<u8>>], block_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(block_len);
        for shard in shards.iter().take(self.data_blocks) {
            if let Some(data) = shard {
                out.extend_from_slice(data);
            }
        }
        out.truncate(block_len);
        out
    }

    /// Per-block shard size: `ceil(block_size / M)`.
    #[must_use]
    pub const fn shard_size(&self) -> usize {
        self.block_size.div_ceil(self.data_blocks)
    }

    /// Size of one drive's shard file for an object of `total_length`
    /// bytes: full blocks contribute `shard_size()` each, the trailing
    /// partial block contributes `ceil(rem / M)`.
    #[must_use]
    pub const fn shard_file_size(&self, total_length: usize) -> usize {
        if total_length == 0 {
            return 0;
        }
        let num_blocks = total_length / self.block_size;
        let last_block = total_length % self.block_size;
        let last_shard = last_block.div_ceil(self.data_blocks);
        num_blocks * self.shard_size() + last_shard
    }

    /// Post-end shard-file offset of the last shard touched by the byte
    /// range `[start, start + length)`, clamped to the shard file size.
    #[must_use]
    pub const fn shard_file_offset(&self, start: usize, length: usize, total_length: usize) -> usize {
        let shard_size = self.shard_size();
        let shard_file_size = self.shard_file_size(total_length);
        let end_shard = (start + length) / self.block_size;
        let till = end_shard * shard_size + shard_size;
        if till > shard_file_size {
            shard_file_size
        } else {
            till
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let e = Erasure::new(4, 2, 1 << 20).unwrap();
        let data: Vec<u8> = (0..997u32).map(|i| (i % 251) as u8).collect();

        let shards = e.encode_data(&data).unwrap();
        assert_eq!(shards.len(), 6);
        let shard_size = shards[0].len();
        assert!(shards.iter().all(|s| s.len() == shard_size));

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[1] = None;
        opts[4] = None;
        e.decode_data(&mut opts).unwrap();
        assert_eq!(e.join_block(&opts, data.len()), data);
    }

    #[test]
    fn test_reconstruct_parity() {
        let e = Erasure::new(2, 2, 1 << 20).unwrap();
        let data = vec![0xA5u8; 300];
        let shards = e.encode_data(&data).unwrap();

        let mut opts: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        opts[3] = None; // parity gap
        e.reconstruct(&mut opts).unwrap();
        assert_eq!(opts[3].as_ref().unwrap(), &shards[3]);
    }

    #[test]
    fn test_insufficient_shards() {
        let e = Erasure::new(4, 2, 1 << 20).unwrap();
        let shards = e.encode_data(&[1u8; 64]).unwrap();
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[0] = None;
        opts[1] = None;
        opts[2] = None;
        let err = e.decode_data(&mut opts).unwrap_err();
        assert!(matches!(
            err,
            CommonError::InsufficientShards { have: 3, need: 4 }
        ));
    }

    #[test]
    fn test_empty_input() {
        let e = Erasure::new(4, 2, 1 << 20).unwrap();
        let shards = e.encode_data(&[]).unwrap();
        assert_eq!(shards.len(), 6);
        assert!(shards.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_shard_geometry() {
        let e = Erasure::new(2, 2, 1 << 20).unwrap();
        assert_eq!(e.shard_size(), 1 << 19);
        // 1 MiB object: exactly one full block.
        assert_eq!(e.shard_file_size(1 << 20), 1 << 19);
        // 1 MiB + 3 bytes: one full block plus ceil(3/2).
        assert_eq!(e.shard_file_size((1 << 20) + 3), (1 << 19) + 2);
        assert_eq!(e.shard_file_size(0), 0);
    }

    #[test]
    fn test_shard_file_offset_clamps() {
        let e = Erasure::new(2, 2, 1 << 20).unwrap();
        let total = (1 << 20) + 3;
        let till = e.shard_file_offset(0, total, total);
        assert_eq!(till, e.shard_file_size(total));
        // Range entirely in the first block reads one shard stripe.
        assert_eq!(e.shard_file_offset(0, 10, total), e.shard_size());
    }
}
