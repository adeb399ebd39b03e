//! Vaultio Disk - the drive abstraction
//!
//! A [`Drive`] is one local directory tree holding one shard of every
//! object in the set. All writes are crash-atomic: data is staged under
//! the reserved namespace and moved into place with a rename; `xl.meta`
//! is rewritten wholesale and committed the same way.
//!
//! [`LocalDrive`] is the production implementation; [`SimDrive`] wraps
//! any drive with controllable latency and failure injection for tests.

pub mod api;
pub mod local;
pub mod sim;

pub use api::{
    CheckPartsResp, DeleteOptions, Drive, FileProps, MetaCacheEntry, PartCheck, RawFileInfo,
    ReadOptions, RenameDataResp, VolInfo, WalkDirOptions,
};
pub use local::LocalDrive;
pub use sim::SimDrive;
