//! Bitrot protection for shard files
//!
//! Every shard file is paired with a streaming digest stored in the
//! version metadata. Writers hash while they write; readers hash while
//! they read and compare against the stored digest after the declared
//! length. A mismatch excludes the shard from decoding and marks the
//! drive for heal.

use highway::{HighwayHash, HighwayHasher, Key};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use vaultio_common::{Error, Result};

/// Fixed 32-byte key for HighwayHash-256 shard digests.
///
/// Changing this key invalidates every digest ever written.
const HIGHWAY_KEY: [u8; 32] = [
    0x4b, 0xe7, 0x34, 0xfa, 0x8e, 0x23, 0x8a, 0xcd, 0x26, 0x3e, 0x83, 0xe6, 0xbb, 0x96, 0x85,
    0x52, 0x04, 0x0f, 0x93, 0x5d, 0xa3, 0x9f, 0x44, 0x14, 0x97, 0xe0, 0x9d, 0x13, 0x22, 0xde,
    0x36, 0xa0,
];

fn highway_key() -> Key {
    let mut lanes = [0u64; 4];
    for (i, lane) in lanes.iter_mut().enumerate() {
        let mut b = [0u8; 8];
        b.copy_from_slice(&HIGHWAY_KEY[i * 8..(i + 1) * 8]);
        *lane = u64::from_le_bytes(b);
    }
    Key(lanes)
}

/// Supported bitrot hash algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitrotAlgorithm {
    /// Keyed HighwayHash-256 (default)
    #[default]
    HighwayHash256,
    /// SHA-512, accepted for objects written by older releases
    Sha512,
}

impl BitrotAlgorithm {
    /// Digest length in bytes.
    #[must_use]
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::HighwayHash256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Create a streaming hasher for this algorithm.
    #[must_use]
    pub fn hasher(&self) -> BitrotHasher {
        match self {
            Self::HighwayHash256 => BitrotHasher::Highway(HighwayHasher::new(highway_key())),
            Self::Sha512 => BitrotHasher::Sha512(Box::new(Sha512::new())),
        }
    }
}

/// Streaming bitrot hasher, owned by a single writer or verifier task.
pub enum BitrotHasher {
    Highway(HighwayHasher),
    Sha512(Box<Sha512>),
}

impl BitrotHasher {
    /// Feed more bytes into the running hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Highway(h) => h.append(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Finish and return the digest.
    #[must_use]
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Highway(h) => {
                let words = h.finalize256();
                let mut out = Vec::with_capacity(32);
                for w in words {
                    out.extend_from_slice(&w.to_le_bytes());
                }
                out
            }
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Expected digest for one shard file, carried in version metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrotVerifier {
    pub algorithm: BitrotAlgorithm,
    pub sum: Vec<u8>,
}

impl BitrotVerifier {
    /// Build a verifier from a stored digest.
    #[must_use]
    pub fn new(algorithm: BitrotAlgorithm, sum: Vec<u8>) -> Self {
        Self { algorithm, sum }
    }

    /// Verify a complete shard in one call.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let mut hasher = self.algorithm.hasher();
        hasher.update(data);
        if hasher.finalize() == self.sum {
            Ok(())
        } else {
            Err(Error::Corrupt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highway_digest_len() {
        let mut h = BitrotAlgorithm::HighwayHash256.hasher();
        h.update(b"some shard bytes");
        assert_eq!(h.finalize().len(), 32);
    }

    #[test]
    fn test_sha512_digest_len() {
        let mut h = BitrotAlgorithm::Sha512.hasher();
        h.update(b"some shard bytes");
        assert_eq!(h.finalize().len(), 64);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let mut a = BitrotAlgorithm::HighwayHash256.hasher();
        a.update(b"hello ");
        a.update(b"world");
        let mut b = BitrotAlgorithm::HighwayHash256.hasher();
        b.update(b"hello world");
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_verifier_detects_flip() {
        let data = vec![0xA5u8; 4096];
        let mut h = BitrotAlgorithm::HighwayHash256.hasher();
        h.update(&data);
        let verifier = BitrotVerifier::new(BitrotAlgorithm::HighwayHash256, h.finalize());

        verifier.verify(&data).unwrap();

        let mut tainted = data;
        tainted[1234] ^= 0x01;
        assert!(matches!(verifier.verify(&tainted), Err(Error::Corrupt)));
    }
}
