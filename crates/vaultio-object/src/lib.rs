//! Vaultio Object - the erasure-set object layer
//!
//! [`ErasureSet`] stitches the drive abstraction, erasure codec, bitrot
//! shield, per-object metadata and distributed lock into the object
//! operations an S3 front-end consumes: bucket CRUD, put/get/delete
//! with versioning, multipart uploads, quorum-resolved listings and
//! self-healing.
//!
//! Consistency model: the distributed write lock linearizes mutations
//! per object; commits are all-or-nothing through temp-and-rename on
//! each drive; readers resolve the modal metadata across drives and
//! need `read-quorum` agreeing copies.

pub mod api;
pub mod erasure_io;
pub mod heal;
pub mod list;
pub mod metacache;
pub mod multipart;
pub mod quorum;
pub mod store;

pub use api::{
    CompletePart, DeleteResult, DriveState, HealDriveState, HealOpts, HealResultItem,
    ListObjectsInfo, MultipartInfo, ObjectInfo, ObjectLayer, ObjectOptions, PartInfo,
    PutObjReader,
};
pub use store::ErasureSet;
