//! Erasure codec self-test
//!
//! Run at process start, before any data is served. Encodes a fixed
//! 256-byte vector for every supported (data, parity) configuration and
//! compares an xxh64 digest of the encoded shards against a table baked
//! in when the codec was introduced, then deletes a shard and verifies
//! reconstruction. Any mismatch means the codec would corrupt data and
//! the process must not serve.

use crate::codec::Erasure;
use vaultio_common::{Error, Result};
use xxhash_rust::xxh64::Xxh64;

/// Expected xxh64 digest of the encoded self-test vector per
/// (data, parity) configuration. Digest covers, for each shard in
/// order, the shard index byte followed by the shard bytes.
const SELF_TEST_DIGESTS: &[(usize, usize, u64)] = &[
    (2, 2, 0x23fb21be2496f5d3),
    (3, 1, 0x60ab052148b010b4),
    (2, 3, 0xa5cd5600ba0d8e7c),
    (3, 2, 0xe64927daef76435a),
    (4, 1, 0x524eaa814d5d86e2),
    (3, 3, 0x672f6f242b227b21),
    (4, 2, 0x62b9552945504fef),
    (5, 1, 0x0f71031a01d70daf),
    (3, 4, 0x0571e41ba23a6dc6),
    (4, 3, 0xcbf9065ee053e518),
    (5, 2, 0x8e5845859939d0f4),
    (6, 1, 0xe2fc1e677cc7d872),
    (4, 4, 0x09a07581dcd03da8),
    (5, 3, 0x7ad9161acbb4c325),
    (6, 2, 0x7ed133de5ca6a58e),
    (7, 1, 0x937ba2b7af467a22),
    (4, 5, 0xbf2d27b55370113f),
    (5, 4, 0xc446b88830b4f800),
    (6, 3, 0x39ef92d0a74cc3c0),
    (7, 2, 0x5fd13a734d27d37a),
    (8, 1, 0xbc5756b9a9ade030),
    (5, 5, 0xabf1573cc6f76165),
    (6, 4, 0x0cfc90052bc25d20),
    (7, 3, 0x3be2722d9b66912f),
    (8, 2, 0xdfd7d9d0b3e36503),
    (9, 1, 0xc77ae0144fcaeb6e),
    (5, 6, 0x7b5598a85045bfb8),
    (6, 5, 0x71c96f6baeef9c58),
    (7, 4, 0x14c628e59011be3d),
    (8, 3, 0x72bb72c2cdbcf99d),
    (9, 2, 0x8a86c7dbebf27b68),
    (10, 1, 0x7d30d91b89fcec21),
    (6, 6, 0x4b79056484883e4c),
    (7, 5, 0xcc3b39ad4c083b9f),
    (8, 4, 0x03ba5e9b41bf07f0),
    (9, 3, 0xa64e3be6d6fe7e92),
    (10, 2, 0xfa5af9aa9f1857a3),
    (11, 1, 0x04ed2929a2df690b),
    (6, 7, 0xb1a0e2427ac2dc1a),
    (7, 6, 0x45af361b7de7a4ff),
    (8, 5, 0xd7dabc15800f9d41),
    (9, 4, 0x239b71c41745d207),
    (10, 3, 0x84bc4bda8af81f90),
    (11, 2, 0xecd6f1b1399775c0),
    (12, 1, 0x3b2a88686122d082),
    (7, 7, 0x456cc320cec8a6e6),
    (8, 6, 0x0b482a6169fd270f),
    (9, 5, 0x2d0803094c5a86ce),
    (10, 4, 0x6c1cba8631de994a),
    (11, 3, 0xc78cfbfc0dc64d01),
    (12, 2, 0x0fd2f30a48a8e2e9),
    (13, 1, 0x9c88e2a9d1b8fff8),
    (7, 8, 0x1867a9f4db315b5c),
    (8, 7, 0x50748e0099d657e8),
    (9, 6, 0xa3c2539b3af84874),
    (10, 5, 0x4383e58a086cc1ac),
    (11, 4, 0xb2643390973702d6),
    (12, 3, 0xd5ce58368ae90b13),
    (13, 2, 0x0cb8460aa4cf6613),
    (14, 1, 0x78a28bbaec57996e),
];

const SELF_TEST_BLOCK_SIZE: usize = 1024 * 1024;

fn test_vector() -> [u8; 256] {
    let mut data = [0u8; 256];
    for (i, b) in data.iter_mut().enumerate() {
        *b = i as u8;
    }
    data
}

/// Validate the erasure codec. Returns an error describing the first
/// failing configuration; the caller treats any error as fatal and must
/// exit before serving.
pub fn self_test() -> Result<()> {
    let data = test_vector();

    for &(data_blocks, parity_blocks, want) in SELF_TEST_DIGESTS {
        let erasure = Erasure::new(data_blocks, parity_blocks, SELF_TEST_BLOCK_SIZE)?;
        let encoded = erasure.encode_data(&data)?;

        let mut hash = Xxh64::new(0);
        for (i, shard) in encoded.iter().enumerate() {
            hash.update(&[i as u8]);
            hash.update(shard);
        }
        let got = hash.digest();
        if got != want {
            return Err(Error::internal(format!(
                "erasure self-test [d:{data_blocks},p:{parity_blocks}]: want {want:#018x}, got {got:#018x}; unsafe to start"
            )));
        }

        // Delete the first shard and reconstruct it.
        let first = encoded[0].clone();
        let mut shards: Vec<Option<Vec<u8>>> = encoded.into_iter().map(Some).collect();
        shards[0] = None;
        erasure.decode_data(&mut shards)?;
        if shards[0].as_deref() != Some(first.as_slice()) {
            return Err(Error::internal(format!(
                "erasure self-test [d:{data_blocks},p:{parity_blocks}]: reconstruction mismatch; unsafe to start"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_test_passes() {
        self_test().unwrap();
    }

    #[test]
    fn test_table_covers_supported_totals() {
        // Every supported set size with at least half data blocks has an
        // entry up to 15 total shards.
        for total in 4..16usize {
            for data in total / 2..total {
                let parity = total - data;
                assert!(
                    SELF_TEST_DIGESTS
                        .iter()
                        .any(|&(d, p, _)| d == data && p == parity),
                    "missing self-test entry for ({data}, {parity})"
                );
            }
        }
    }
}
