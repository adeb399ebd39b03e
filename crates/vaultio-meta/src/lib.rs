//! Vaultio Meta - the `xl.meta` per-object metadata format
//!
//! Every object directory on every drive carries exactly one `xl.meta`
//! file listing all versions of that object. The file is self-framed:
//!
//! ```text
//! [0..4)  magic "XL2 "
//! [4..6)  major version, u16 LE      [6..8) minor version, u16 LE
//! [8..)   msgpack bin: body (indexed header/version pairs for minor 3)
//!         msgpack u32: xxh64-low-32 CRC over the body (minor >= 2)
//!         inline-data region: msgpack map version-id -> shard bytes
//! ```
//!
//! The version array is kept sorted by modification time descending, so
//! index 0 is always the latest version. Listings decode only the
//! lightweight per-version headers; full version records are decoded
//! lazily.
//!
//! Writers always emit the current minor (3); readers accept minors
//! 0 through 3.

pub mod fileinfo;
pub mod format;
pub mod inline;
pub mod version;

pub use fileinfo::{ChecksumInfo, ErasureAlgo, ErasureInfo, FileInfo, ObjectPartInfo};
pub use format::{is_xl2_format, FileMeta, ShallowVersion};
pub use inline::InlineData;
pub use version::{
    MetaDeleteMarker, MetaObject, Version, VersionHeader, VersionType, FLAG_FREE_VERSION,
    FLAG_USES_DATA_DIR,
};

/// Internal metadata key prefix; keys under this prefix never surface
/// to clients.
pub const RESERVED_META_PREFIX: &str = "x-vaultio-internal-";

/// Marks a version whose shard bytes live inline in `xl.meta`.
pub const META_INLINE_DATA: &str = "x-vaultio-internal-inline-data";

/// Marks a free version: a tombstone scheduling async tier cleanup.
pub const META_FREE_VERSION: &str = "x-vaultio-internal-free-version";

/// Tier name of transitioned (externally tiered) object content.
pub const META_TRANSITION_TIER: &str = "x-vaultio-internal-transition-tier";

/// Remote object name of transitioned content.
pub const META_TRANSITIONED_OBJECT: &str = "x-vaultio-internal-transitioned-object";

/// Replication status of a delete marker; a pending status makes
/// deletes rewrite the marker in place instead of dropping it.
pub const META_REPLICATION_STATUS: &str = "x-vaultio-internal-replication-status";
