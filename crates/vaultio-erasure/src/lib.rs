//! Vaultio Erasure - Reed-Solomon coding and bitrot protection
//!
//! This crate provides the two data-integrity layers of vaultio:
//!
//! - **Erasure codec**: Reed-Solomon over GF(2^8) with M data + N parity
//!   shards. Any M shards reconstruct the original bytes; heal rebuilds
//!   missing data *and* parity shards.
//! - **Bitrot shield**: a streaming hash per shard file
//!   (HighwayHash-256 by default, SHA-512 accepted as legacy) detecting
//!   silent on-disk corruption before a shard enters a decode.
//!
//! A startup [`self_test`] validates the codec against a baked-in digest
//! table; a mismatch means the build is unsafe to serve data.
//!
//! # Example
//!
//! ```
//! use vaultio_erasure::Erasure;
//!
//! let erasure = Erasure::new(4, 2, 1024 * 1024).unwrap();
//! let shards = erasure.encode_data(b"hello erasure world").unwrap();
//! assert_eq!(shards.len(), 6);
//! ```

pub mod bitrot;
pub mod codec;
mod selftest;

pub use bitrot::{BitrotAlgorithm, BitrotHasher, BitrotVerifier};
pub use codec::{Erasure, ErasureError};
pub use selftest::self_test;
