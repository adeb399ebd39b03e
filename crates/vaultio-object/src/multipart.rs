//! Multipart uploads: staged in the reserved namespace, committed into
//! the object namespace by the same rename path as a plain write.
//!
//! Layout per drive while an upload is live:
//!
//! ```text
//! .vaultio.sys/multipart/<key-hash>/<upload-id>/xl.meta      upload marker
//! .vaultio.sys/multipart/<key-hash>/<upload-id>/part.N       this drive's shard
//! .vaultio.sys/multipart/<key-hash>/<upload-id>/part.N.meta  per-drive part record
//! ```

use crate::api::{CompletePart, MultipartInfo, ObjectInfo, ObjectOptions, PartInfo, PutObjReader};
use crate::erasure_io;
use crate::quorum::{hash_order, reduce_quorum_errs};
use crate::store::{now_ns, ErasureSet, TeeReader};
use bytes::Bytes;
use futures::future::join_all;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;
use vaultio_common::{Error, ObjectKey, Result, RESERVED_BUCKET, RESERVED_MULTIPART};
use vaultio_disk::DeleteOptions;
use vaultio_erasure::{BitrotAlgorithm, Erasure};
use vaultio_meta::{ChecksumInfo, ErasureInfo, FileInfo, ObjectPartInfo};

/// Smallest allowed part, except for the final part of an upload.
const MIN_PART_SIZE: i64 = 5 * 1024 * 1024;
/// Largest accepted part number.
const MAX_PARTS: usize = 10_000;

/// Per-drive part record written next to the part's shard file.
#[derive(Serialize, Deserialize)]
struct PartMeta {
    number: usize,
    size: i64,
    actual_size: i64,
    etag: String,
    algorithm: BitrotAlgorithm,
    checksum: Vec<u8>,
}

fn upload_dir(bucket: &str, object: &str, upload_id: &str) -> String {
    let key_hash = hex::encode(Sha256::digest(format!("{bucket}/{object}").as_bytes()));
    format!("{RESERVED_MULTIPART}/{key_hash}/{upload_id}")
}

impl ErasureSet {
    /// Resolve the upload marker, mapping absence to `UploadNotFound`.
    async fn upload_fileinfo(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<FileInfo> {
        let dir = upload_dir(bucket, object, upload_id);
        let (metas, errs) = self
            .read_all_fileinfo(RESERVED_BUCKET, &dir, None, false, false)
            .await;
        let quorum = self.config().read_quorum();
        if let Some(err) = reduce_quorum_errs(
            &errs,
            quorum,
            Error::ReadQuorum {
                have: metas.iter().filter(|m| m.is_some()).count(),
                want: quorum,
            },
        ) {
            return Err(if err.is_not_found() {
                Error::UploadNotFound(upload_id.to_string())
            } else {
                err
            });
        }
        crate::quorum::find_file_info_in_quorum(&metas, quorum).map(|(fi, _)| fi)
    }

    pub(crate) async fn new_multipart_upload_inner(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<MultipartInfo> {
        ObjectKey::validate(object)?;
        self.check_bucket_exists(bucket).await?;

        let upload_id = Uuid::new_v4().to_string();
        let dir = upload_dir(bucket, object, &upload_id);
        let dist = hash_order(&format!("{bucket}/{object}"), self.config().drive_count());
        let mod_time = now_ns();

        let results = join_all(self.drives().iter().enumerate().map(|(i, drive)| {
            let mut fi = FileInfo::new(RESERVED_BUCKET, &dir);
            fi.mod_time = mod_time;
            fi.metadata = opts.user_defined.clone();
            fi.erasure = ErasureInfo {
                algorithm: Default::default(),
                data_blocks: self.config().data_blocks,
                parity_blocks: self.config().parity_blocks,
                block_size: self.config().block_size,
                index: dist[i] as usize,
                distribution: dist.clone(),
                checksums: Vec::new(),
            };
            let dir = dir.clone();
            async move { drive.write_metadata(RESERVED_BUCKET, &dir, fi).await }
        }))
        .await;

        let errs: Vec<Option<Error>> = results.into_iter().map(Result::err).collect();
        let quorum = self.config().write_quorum();
        if let Some(err) = reduce_quorum_errs(
            &errs,
            quorum,
            Error::WriteQuorum {
                have: errs.iter().filter(|e| e.is_none()).count(),
                want: quorum,
            },
        ) {
            return Err(err);
        }

        debug!(bucket, object, upload_id, "multipart upload started");
        Ok(MultipartInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id,
            user_defined: opts.user_defined.clone(),
        })
    }

    pub(crate) async fn put_object_part_inner(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: usize,
        data: PutObjReader,
    ) -> Result<PartInfo> {
        if part_number == 0 || part_number > MAX_PARTS {
            return Err(Error::InvalidPart(part_number));
        }
        let upload_fi = self.upload_fileinfo(bucket, object, upload_id).await?;
        let dir = upload_dir(bucket, object, upload_id);

        let erasure = Erasure::new(
            upload_fi.erasure.data_blocks,
            upload_fi.erasure.parity_blocks,
            upload_fi.erasure.block_size,
        )?;
        let algo = BitrotAlgorithm::default();
        let dist = &upload_fi.erasure.distribution;
        let drives_by_shard = Self::shard_order(dist, &self.online_drives());
        let write_quorum = self.config().write_quorum();

        // Stage under a unique name: a retried part number must replace
        // the old shard, never append to it.
        let staging = format!("{dir}/{}.part.{part_number}", Uuid::new_v4());
        let (mut reader, _declared) = data.into_inner();
        let mut etag_hasher = Md5::new();
        let mut tee = TeeReader::new(&mut reader, &mut etag_hasher);

        let outcome = match erasure_io::write_shards(
            &drives_by_shard,
            &staging,
            &erasure,
            algo,
            &mut tee,
            write_quorum,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                join_all(self.drives().iter().map(|d| {
                    d.delete(RESERVED_BUCKET, &staging, DeleteOptions::default())
                }))
                .await;
                return Err(e);
            }
        };
        let etag = hex::encode(etag_hasher.finalize());

        // Promote the staged shard and record the part on each drive
        // that completed the stream.
        let final_part = format!("{dir}/part.{part_number}");
        let results = join_all((0..self.config().drive_count()).map(|i| {
            let shard_idx = dist[i] as usize;
            let sum = outcome.checksums.get(shard_idx - 1).cloned().flatten();
            let drive = self.drives()[i].clone();
            let staging = staging.clone();
            let final_part = final_part.clone();
            let meta = sum.map(|checksum| PartMeta {
                number: part_number,
                size: outcome.total_size as i64,
                actual_size: outcome.total_size as i64,
                etag: etag.clone(),
                algorithm: algo,
                checksum,
            });
            async move {
                let Some(meta) = meta else {
                    return Err(Error::DriveOffline);
                };
                drive
                    .rename_file(RESERVED_BUCKET, &staging, RESERVED_BUCKET, &final_part)
                    .await?;
                let buf = rmp_serde::to_vec(&meta)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                drive
                    .write_all(
                        RESERVED_BUCKET,
                        &format!("{final_part}.meta"),
                        Bytes::from(buf),
                    )
                    .await
            }
        }))
        .await;

        let errs: Vec<Option<Error>> = results.into_iter().map(Result::err).collect();
        if let Some(err) = reduce_quorum_errs(
            &errs,
            write_quorum,
            Error::WriteQuorum {
                have: errs.iter().filter(|e| e.is_none()).count(),
                want: write_quorum,
            },
        ) {
            // Drop the stragglers so a later retry starts clean.
            join_all(self.drives().iter().map(|d| {
                d.delete(RESERVED_BUCKET, &staging, DeleteOptions::default())
            }))
            .await;
            return Err(err);
        }

        Ok(PartInfo {
            number: part_number,
            etag,
            size: outcome.total_size as i64,
            actual_size: outcome.total_size as i64,
        })
    }

    pub(crate) async fn list_object_parts_inner(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_marker: usize,
        max_parts: usize,
    ) -> Result<Vec<PartInfo>> {
        self.upload_fileinfo(bucket, object, upload_id).await?;
        let dir = upload_dir(bucket, object, upload_id);
        let max_parts = if max_parts == 0 { MAX_PARTS } else { max_parts };

        let mut numbers: Vec<usize> = Vec::new();
        for drive in self.drives() {
            let Ok(names) = drive.list_dir(RESERVED_BUCKET, &dir, 0).await else {
                continue;
            };
            for name in names {
                if let Some(rest) = name.strip_prefix("part.") {
                    if let Some(num) = rest.strip_suffix(".meta").and_then(|n| n.parse().ok()) {
                        if !numbers.contains(&num) {
                            numbers.push(num);
                        }
                    }
                }
            }
            break;
        }
        numbers.sort_unstable();

        let mut parts = Vec::new();
        for num in numbers
            .into_iter()
            .filter(|n| *n > part_marker)
            .take(max_parts)
        {
            if let Some(meta) = self.read_part_meta(&dir, num).await {
                parts.push(PartInfo {
                    number: meta.number,
                    etag: meta.etag,
                    size: meta.size,
                    actual_size: meta.actual_size,
                });
            }
        }
        Ok(parts)
    }

    async fn read_part_meta(&self, dir: &str, part_number: usize) -> Option<PartMeta> {
        let path = format!("{dir}/part.{part_number}.meta");
        for drive in self.drives() {
            if let Ok(buf) = drive.read_all(RESERVED_BUCKET, &path).await {
                if let Ok(meta) = rmp_serde::from_slice::<PartMeta>(&buf) {
                    return Some(meta);
                }
            }
        }
        None
    }

    pub(crate) async fn complete_multipart_upload_inner(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        let lock = self.ns_lock(bucket, object);
        if !opts.no_lock && !lock.lock("complete-multipart", &self.lock_options()).await {
            return Err(Error::LockTimeout(format!("{bucket}/{object}")));
        }
        let res = self
            .complete_multipart_locked(bucket, object, upload_id, parts, opts)
            .await;
        if !opts.no_lock {
            lock.unlock().await;
        }
        res
    }

    async fn complete_multipart_locked(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        if parts.is_empty() {
            return Err(Error::InvalidPart(0));
        }
        let upload_fi = self.upload_fileinfo(bucket, object, upload_id).await?;
        let dir = upload_dir(bucket, object, upload_id);

        // Validate the requested parts against what was uploaded.
        let mut table: Vec<ObjectPartInfo> = Vec::with_capacity(parts.len());
        let mut etag_hasher = Md5::new();
        let mut total_size = 0i64;
        let mut last_number = 0usize;
        for (pos, part) in parts.iter().enumerate() {
            if part.part_number <= last_number {
                return Err(Error::InvalidPart(part.part_number));
            }
            last_number = part.part_number;

            let meta = self
                .read_part_meta(&dir, part.part_number)
                .await
                .ok_or(Error::InvalidPart(part.part_number))?;
            if meta.etag != part.etag {
                return Err(Error::InvalidPart(part.part_number));
            }
            if pos + 1 < parts.len() && meta.size < MIN_PART_SIZE {
                return Err(Error::PartTooSmall {
                    part: part.part_number,
                    size: meta.size as u64,
                });
            }
            if let Ok(bytes) = hex::decode(&meta.etag) {
                etag_hasher.update(&bytes);
            }
            total_size += meta.size;
            table.push(ObjectPartInfo {
                number: meta.number,
                size: meta.size,
                actual_size: meta.actual_size,
                etag: Some(meta.etag),
            });
        }
        let etag = format!("{}-{}", hex::encode(etag_hasher.finalize()), table.len());

        let data_dir = Uuid::new_v4();
        let mod_time = opts.mod_time.unwrap_or_else(now_ns);
        let version_id = if opts.versioned {
            Some(opts.version_id.unwrap_or_else(Uuid::new_v4))
        } else {
            None
        };
        let dist = upload_fi.erasure.distribution.clone();
        let write_quorum = self.config().write_quorum();

        // Per drive: move part files under the final data dir and
        // collect that drive's digests.
        let mut commit_fis: Vec<Option<FileInfo>> = Vec::with_capacity(self.drives().len());
        for (i, drive) in self.drives().iter().enumerate() {
            let mut checksums = Vec::with_capacity(table.len());
            let mut complete = true;
            for part in &table {
                let src = format!("{dir}/part.{}", part.number);
                let dst = format!("{dir}/{data_dir}/part.{}", part.number);
                let meta_path = format!("{dir}/part.{}.meta", part.number);

                let meta = match drive.read_all(RESERVED_BUCKET, &meta_path).await {
                    Ok(buf) => match rmp_serde::from_slice::<PartMeta>(&buf) {
                        Ok(meta) => meta,
                        Err(_) => {
                            complete = false;
                            break;
                        }
                    },
                    Err(_) => {
                        complete = false;
                        break;
                    }
                };
                if drive
                    .rename_file(RESERVED_BUCKET, &src, RESERVED_BUCKET, &dst)
                    .await
                    .is_err()
                {
                    complete = false;
                    break;
                }
                checksums.push(ChecksumInfo {
                    part_number: part.number,
                    algorithm: meta.algorithm,
                    hash: meta.checksum,
                });
            }
            if !complete {
                commit_fis.push(None);
                continue;
            }

            let mut fi = FileInfo::new(bucket, object);
            fi.version_id = version_id;
            fi.data_dir = Some(data_dir);
            fi.mod_time = mod_time;
            fi.size = total_size;
            fi.etag = Some(etag.clone());
            fi.metadata = upload_fi.metadata.clone();
            fi.parts = table.clone();
            fi.erasure = ErasureInfo {
                algorithm: Default::default(),
                data_blocks: upload_fi.erasure.data_blocks,
                parity_blocks: upload_fi.erasure.parity_blocks,
                block_size: upload_fi.erasure.block_size,
                index: dist[i] as usize,
                distribution: dist.clone(),
                checksums,
            };
            commit_fis.push(Some(fi));
        }

        self.commit_rename(bucket, object, &dir, commit_fis, write_quorum)
            .await?;

        debug!(bucket, object, upload_id, parts = table.len(), "multipart upload completed");
        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            version_id,
            is_latest: true,
            delete_marker: false,
            mod_time,
            size: total_size,
            etag: Some(etag),
            user_defined: upload_fi.metadata.clone(),
            parts: table.len(),
            num_versions: 1,
        })
    }

    pub(crate) async fn abort_multipart_upload_inner(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.upload_fileinfo(bucket, object, upload_id).await?;
        let dir = upload_dir(bucket, object, upload_id);
        join_all(self.drives().iter().map(|d| {
            d.delete(
                RESERVED_BUCKET,
                &dir,
                DeleteOptions {
                    recursive: true,
                    immediate: true,
                },
            )
        }))
        .await;
        warn!(bucket, object, upload_id, "multipart upload aborted");
        Ok(())
    }
}
