//! The erasure set: drives + lockers + configuration, and the
//! put/get/delete state machines.

use crate::api::{
    DeleteResult, ObjectInfo, ObjectLayer, ObjectOptions, PutObjReader,
};
use crate::erasure_io;
use crate::quorum::{
    find_file_info_in_quorum, hash_order, object_quorums, reduce_quorum_errs,
};
use async_trait::async_trait;
use futures::future::join_all;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vaultio_common::{
    BucketInfo, BucketName, Error, LockConfig, ObjectKey, Result, SetConfig,
    INLINE_DATA_THRESHOLD, RESERVED_BUCKET, RESERVED_TMP,
};
use vaultio_disk::{DeleteOptions, Drive, ReadOptions};
use vaultio_erasure::{BitrotAlgorithm, Erasure};
use vaultio_lock::{DRWLock, LockOptions, Locker};
use vaultio_meta::{ChecksumInfo, ErasureInfo, FileInfo, ObjectPartInfo};

/// Overall deadline for namespace lock acquisition.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted single-call object write: 5 TiB.
const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 * 1024;

static SELF_TEST: std::sync::OnceLock<std::result::Result<(), String>> = std::sync::OnceLock::new();

/// Nanoseconds since the Unix epoch.
pub(crate) fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// One erasure set: a fixed collection of drives plus the peer lockers
/// that serialize namespace mutations across hosts.
pub struct ErasureSet {
    drives: Vec<Arc<dyn Drive>>,
    lockers: Arc<Vec<Arc<dyn Locker>>>,
    config: SetConfig,
    lock_config: LockConfig,
    owner: String,
}

impl ErasureSet {
    /// Assemble a set. Validates the configuration, verifies the
    /// erasure codec (once per process) and prepares the reserved
    /// namespace on every drive.
    pub async fn new(
        drives: Vec<Arc<dyn Drive>>,
        lockers: Vec<Arc<dyn Locker>>,
        config: SetConfig,
        lock_config: LockConfig,
        owner: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        if drives.len() != config.drive_count() {
            return Err(Error::config(format!(
                "set wants {} drives, got {}",
                config.drive_count(),
                drives.len()
            )));
        }
        if lockers.is_empty() {
            return Err(Error::config("at least one lock peer is required"));
        }

        SELF_TEST
            .get_or_init(|| vaultio_erasure::self_test().map_err(|e| e.to_string()))
            .clone()
            .map_err(Error::Internal)?;

        Ok(Self {
            drives,
            lockers: Arc::new(lockers),
            config,
            lock_config,
            owner: owner.into(),
        })
    }

    /// The set configuration.
    #[must_use]
    pub fn config(&self) -> &SetConfig {
        &self.config
    }

    /// Drives in set order.
    #[must_use]
    pub fn drives(&self) -> &[Arc<dyn Drive>] {
        &self.drives
    }

    pub(crate) fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: LOCK_ACQUIRE_TIMEOUT,
            call_timeout: self.lock_config.call_timeout(),
            refresh_interval: self.lock_config.refresh(),
        }
    }

    /// A namespace lock handle for `bucket/object`.
    pub(crate) fn ns_lock(&self, bucket: &str, object: &str) -> DRWLock {
        let resource = if object.is_empty() {
            bucket.to_string()
        } else {
            format!("{bucket}/{object}")
        };
        DRWLock::new(Arc::clone(&self.lockers), self.owner.clone(), vec![resource])
    }

    /// Drives in set order, `None` where offline.
    pub(crate) fn online_drives(&self) -> Vec<Option<Arc<dyn Drive>>> {
        self.drives
            .iter()
            .map(|d| d.is_online().then(|| Arc::clone(d)))
            .collect()
    }

    /// Reorder per-drive items into shard order using a distribution
    /// permutation (`dist[i]` is the 1-based shard held by drive `i`).
    pub(crate) fn shard_order<T: Clone>(dist: &[u8], items: &[Option<T>]) -> Vec<Option<T>> {
        let mut out = vec![None; dist.len()];
        for (i, shard) in dist.iter().enumerate() {
            let idx = *shard as usize - 1;
            if idx < out.len() {
                out[idx] = items.get(i).cloned().flatten();
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Buckets

    async fn make_bucket_inner(&self, bucket: &str) -> Result<()> {
        BucketName::validate(bucket)?;
        let lock = self.ns_lock(bucket, "");
        if !lock.lock("make-bucket", &self.lock_options()).await {
            return Err(Error::LockTimeout(bucket.to_string()));
        }
        let res = async {
            let results = join_all(self.drives.iter().map(|d| d.make_vol(bucket))).await;
            let errs: Vec<Option<Error>> = results.into_iter().map(Result::err).collect();
            let quorum = self.config.write_quorum();
            if let Some(err) = reduce_quorum_errs(
                &errs,
                quorum,
                Error::WriteQuorum {
                    have: errs.iter().filter(|e| e.is_none()).count(),
                    want: quorum,
                },
            ) {
                let err = match err {
                    Error::VolumeExists(_) => Error::BucketExists(bucket.to_string()),
                    other => other,
                };
                return Err(err);
            }
            info!(bucket, "bucket created");
            Ok(())
        }
        .await;
        lock.unlock().await;
        res
    }

    pub(crate) async fn get_bucket_info_inner(&self, bucket: &str) -> Result<BucketInfo> {
        let results = join_all(self.drives.iter().map(|d| d.stat_vol(bucket))).await;
        let mut infos = Vec::new();
        let mut errs = Vec::new();
        for res in results {
            match res {
                Ok(info) => {
                    infos.push(info);
                    errs.push(None);
                }
                Err(e) => errs.push(Some(e)),
            }
        }
        let quorum = self.config.read_quorum();
        if let Some(err) = reduce_quorum_errs(
            &errs,
            quorum,
            Error::ReadQuorum {
                have: infos.len(),
                want: quorum,
            },
        ) {
            return Err(match err {
                Error::VolumeNotFound(_) => Error::BucketNotFound(bucket.to_string()),
                other => other,
            });
        }
        let created = infos.iter().map(|i| i.created).min().unwrap_or_default();
        Ok(BucketInfo {
            name: bucket.to_string(),
            created,
        })
    }

    async fn list_buckets_inner(&self) -> Result<Vec<BucketInfo>> {
        let results = join_all(self.drives.iter().map(|d| d.list_vols())).await;
        let mut seen: HashMap<String, (i64, usize)> = HashMap::new();
        let mut responded = 0usize;
        for res in results.into_iter().flatten() {
            responded += 1;
            for vol in res {
                let entry = seen.entry(vol.name).or_insert((vol.created, 0));
                entry.0 = entry.0.min(vol.created);
                entry.1 += 1;
            }
        }
        if responded < self.config.read_quorum() {
            return Err(Error::ReadQuorum {
                have: responded,
                want: self.config.read_quorum(),
            });
        }
        let quorum = self.config.read_quorum();
        let mut buckets: Vec<BucketInfo> = seen
            .into_iter()
            .filter(|(_, (_, n))| *n >= quorum)
            .map(|(name, (created, _))| BucketInfo { name, created })
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn delete_bucket_inner(&self, bucket: &str) -> Result<()> {
        let lock = self.ns_lock(bucket, "");
        if !lock.lock("delete-bucket", &self.lock_options()).await {
            return Err(Error::LockTimeout(bucket.to_string()));
        }
        let res = async {
            let results = join_all(self.drives.iter().map(|d| d.delete_vol(bucket, false))).await;
            let errs: Vec<Option<Error>> = results.into_iter().map(Result::err).collect();
            let quorum = self.config.write_quorum();
            if let Some(err) = reduce_quorum_errs(
                &errs,
                quorum,
                Error::WriteQuorum {
                    have: errs.iter().filter(|e| e.is_none()).count(),
                    want: quorum,
                },
            ) {
                return Err(match err {
                    Error::VolumeNotFound(_) => Error::BucketNotFound(bucket.to_string()),
                    Error::VolumeNotEmpty(_) => Error::BucketNotEmpty(bucket.to_string()),
                    other => other,
                });
            }
            Ok(())
        }
        .await;
        lock.unlock().await;
        res
    }

    pub(crate) async fn check_bucket_exists(&self, bucket: &str) -> Result<()> {
        self.get_bucket_info_inner(bucket).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Metadata resolution

    /// Read every drive's view of one version.
    pub(crate) async fn read_all_fileinfo(
        &self,
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        read_data: bool,
        incl_free_versions: bool,
    ) -> (Vec<Option<FileInfo>>, Vec<Option<Error>>) {
        let results = join_all(self.drives.iter().map(|d| {
            d.read_version(
                bucket,
                object,
                version_id,
                ReadOptions {
                    read_data,
                    incl_free_versions,
                },
            )
        }))
        .await;
        let mut metas = Vec::with_capacity(results.len());
        let mut errs = Vec::with_capacity(results.len());
        for res in results {
            match res {
                Ok(fi) => {
                    metas.push(Some(fi));
                    errs.push(None);
                }
                Err(e) => {
                    metas.push(None);
                    errs.push(Some(e));
                }
            }
        }
        (metas, errs)
    }

    /// Resolve the quorum view of one object version: the canonical
    /// record, each drive's own record, and the agreeing-drive mask.
    pub(crate) async fn resolve_object(
        &self,
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        read_data: bool,
        incl_free_versions: bool,
    ) -> Result<(FileInfo, Vec<Option<FileInfo>>, Vec<bool>)> {
        let (metas, errs) = self
            .read_all_fileinfo(bucket, object, version_id, read_data, incl_free_versions)
            .await;

        let quorum = self.config.read_quorum();
        if let Some(err) = reduce_quorum_errs(
            &errs,
            quorum,
            Error::ReadQuorum {
                have: errs.iter().filter(|e| e.is_none()).count(),
                want: quorum,
            },
        ) {
            return Err(match err {
                Error::FileNotFound | Error::VolumeNotFound(_) => {
                    Error::object_not_found(bucket, object)
                }
                Error::FileVersionNotFound => Error::version_not_found(
                    bucket,
                    object,
                    version_id.map(|v| v.to_string()).unwrap_or_default(),
                ),
                other => other,
            });
        }

        let (canonical, in_group) = find_file_info_in_quorum(&metas, quorum)?;
        Ok((canonical, metas, in_group))
    }

    /// Shard-ordered drive and metadata slices for reads: entry `i`
    /// serves erasure shard `i + 1`, populated only from drives in the
    /// agreeing metadata group.
    pub(crate) fn shard_views(
        &self,
        metas: &[Option<FileInfo>],
        in_group: &[bool],
        total: usize,
    ) -> (Vec<Option<Arc<dyn Drive>>>, Vec<Option<FileInfo>>) {
        let mut drives: Vec<Option<Arc<dyn Drive>>> = vec![None; total];
        let mut views: Vec<Option<FileInfo>> = vec![None; total];
        for (i, (meta, ok)) in metas.iter().zip(in_group.iter()).enumerate() {
            let (Some(fi), true) = (meta, *ok) else {
                continue;
            };
            let idx = fi.erasure.index;
            if idx >= 1 && idx <= total && views[idx - 1].is_none() {
                if self.drives[i].is_online() {
                    drives[idx - 1] = Some(Arc::clone(&self.drives[i]));
                }
                views[idx - 1] = Some(fi.clone());
            }
        }
        (drives, views)
    }

    // ------------------------------------------------------------------
    // PUT

    async fn put_object_inner(
        &self,
        bucket: &str,
        object: &str,
        data: PutObjReader,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        ObjectKey::validate(object)?;

        let lock = self.ns_lock(bucket, object);
        if !opts.no_lock && !lock.lock("put-object", &self.lock_options()).await {
            return Err(Error::LockTimeout(format!("{bucket}/{object}")));
        }
        let res = self.put_object_locked(bucket, object, data, opts, &lock).await;
        if !opts.no_lock {
            lock.unlock().await;
        }
        // A bucket missing across the quorum shows up as per-drive
        // volume errors.
        res.map_err(|e| match e {
            Error::VolumeNotFound(v) => Error::BucketNotFound(v),
            other => other,
        })
    }

    async fn put_object_locked(
        &self,
        bucket: &str,
        object: &str,
        data: PutObjReader,
        opts: &ObjectOptions,
        lock: &DRWLock,
    ) -> Result<ObjectInfo> {
        let config = &self.config;
        let erasure = Erasure::new(
            config.data_blocks,
            config.parity_blocks,
            config.block_size,
        )?;
        let algo = BitrotAlgorithm::default();
        let dist = hash_order(&format!("{bucket}/{object}"), config.drive_count());

        let version_id = if opts.versioned {
            Some(opts.version_id.unwrap_or_else(Uuid::new_v4))
        } else {
            None
        };
        let data_dir = Uuid::new_v4();
        let tmp_id = Uuid::new_v4();
        let tmp_dir = format!("{RESERVED_TMP}/{tmp_id}");
        let mod_time = opts.mod_time.unwrap_or_else(now_ns);

        let (mut reader, declared) = data.into_inner();
        if let Some(sz) = declared {
            if sz > MAX_OBJECT_SIZE {
                return Err(Error::EntityTooLarge {
                    size: sz,
                    max_size: MAX_OBJECT_SIZE,
                });
            }
        }
        let write_quorum = config.write_quorum();

        // Small objects go inline into xl.meta; everything else streams
        // into the staging area block by block.
        let inline = declared.is_some_and(|sz| sz as usize <= INLINE_DATA_THRESHOLD);

        let mut etag_hasher = Md5::new();
        let total_size;
        let mut inline_shards: Option<Vec<Vec<u8>>> = None;
        let checksums: Vec<Option<Vec<u8>>>;

        if inline {
            let mut buf = Vec::with_capacity(declared.unwrap_or(0) as usize);
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(Error::DriveIo)?;
            etag_hasher.update(&buf);
            total_size = buf.len() as u64;
            let (shards, sums) = erasure_io::encode_inline(&erasure, algo, &buf)?;
            checksums = sums.into_iter().map(Some).collect();
            inline_shards = Some(shards);
        } else {
            let drives_by_shard = Self::shard_order(&dist, &self.online_drives());
            let tmp_part = format!("{tmp_dir}/{data_dir}/part.1");
            let mut tee = TeeReader::new(&mut reader, &mut etag_hasher);
            let outcome = match erasure_io::write_shards(
                &drives_by_shard,
                &tmp_part,
                &erasure,
                algo,
                &mut tee,
                write_quorum,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.cleanup_tmp(&tmp_dir).await;
                    return Err(e);
                }
            };
            total_size = outcome.total_size;
            checksums = outcome.checksums;
        }

        let etag = hex::encode(etag_hasher.finalize());

        if let Some(declared) = declared {
            if declared != total_size {
                self.cleanup_tmp(&tmp_dir).await;
                return Err(Error::BadDigest {
                    expected: format!("{declared} bytes"),
                    computed: format!("{total_size} bytes"),
                });
            }
        }

        // One FileInfo per drive: shared version data plus the drive's
        // shard index, digest and (when inline) shard bytes.
        let mut commit_fis: Vec<Option<FileInfo>> = Vec::with_capacity(self.drives.len());
        for (i, _) in self.drives.iter().enumerate() {
            let shard_idx = dist[i] as usize;
            let sum = checksums.get(shard_idx - 1).cloned().flatten();
            let Some(sum) = sum else {
                commit_fis.push(None);
                continue;
            };

            let mut fi = FileInfo::new(bucket, object);
            fi.version_id = version_id;
            fi.data_dir = Some(data_dir);
            fi.mod_time = mod_time;
            fi.size = total_size as i64;
            fi.etag = Some(etag.clone());
            fi.metadata = opts.user_defined.clone();
            fi.parts = vec![ObjectPartInfo {
                number: 1,
                size: total_size as i64,
                actual_size: total_size as i64,
                etag: None,
            }];
            fi.erasure = ErasureInfo {
                algorithm: Default::default(),
                data_blocks: config.data_blocks,
                parity_blocks: config.parity_blocks,
                block_size: config.block_size,
                index: shard_idx,
                distribution: dist.clone(),
                checksums: vec![ChecksumInfo {
                    part_number: 1,
                    algorithm: algo,
                    hash: sum,
                }],
            };
            if let Some(shards) = &inline_shards {
                fi.set_inline_data();
                fi.data = Some(shards[shard_idx - 1].clone());
            }
            commit_fis.push(Some(fi));
        }

        if !opts.no_lock && lock.is_lost() {
            self.cleanup_tmp(&tmp_dir).await;
            return Err(Error::LockLost);
        }

        self.commit_rename(bucket, object, &tmp_dir, commit_fis, write_quorum)
            .await?;

        debug!(bucket, object, size = total_size, ?version_id, "object written");

        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            version_id,
            is_latest: true,
            delete_marker: false,
            mod_time,
            size: total_size as i64,
            etag: Some(etag),
            user_defined: opts.user_defined.clone(),
            parts: 1,
            num_versions: 1,
        })
    }

    /// Commit staged data on every drive and enforce the write quorum,
    /// rolling the object back everywhere when the quorum is missed.
    pub(crate) async fn commit_rename(
        &self,
        bucket: &str,
        object: &str,
        tmp_dir: &str,
        commit_fis: Vec<Option<FileInfo>>,
        write_quorum: usize,
    ) -> Result<()> {
        let results = join_all(self.drives.iter().zip(commit_fis.iter()).map(
            |(drive, fi)| async move {
                match fi {
                    Some(fi) => {
                        drive
                            .rename_data(RESERVED_BUCKET, tmp_dir, fi.clone(), bucket, object)
                            .await
                            .map(|_| ())
                    }
                    None => Err(Error::DriveOffline),
                }
            },
        ))
        .await;

        let errs: Vec<Option<Error>> = results.into_iter().map(Result::err).collect();
        let committed = errs.iter().filter(|e| e.is_none()).count();

        if committed < write_quorum {
            warn!(
                bucket,
                object, committed, write_quorum, "commit below write quorum; rolling back"
            );
            // Undo partial commits so no torn object is observable.
            join_all(self.drives.iter().enumerate().filter_map(|(i, drive)| {
                if errs[i].is_none() {
                    let fi = commit_fis[i].clone()?;
                    Some(async move { drive.delete_version(bucket, object, fi).await })
                } else {
                    None
                }
            }))
            .await;
            self.cleanup_tmp(tmp_dir).await;
            return Err(reduce_quorum_errs(
                &errs,
                write_quorum,
                Error::WriteQuorum {
                    have: committed,
                    want: write_quorum,
                },
            )
            .unwrap_or(Error::WriteQuorum {
                have: committed,
                want: write_quorum,
            }));
        }

        // Drives that missed the commit keep their staging leftovers
        // until cleanup; the object there is heal-eligible.
        self.cleanup_tmp(tmp_dir).await;
        Ok(())
    }

    /// Best-effort staging cleanup on every drive.
    pub(crate) async fn cleanup_tmp(&self, tmp_dir: &str) {
        join_all(self.drives.iter().map(|d| {
            d.delete(
                RESERVED_BUCKET,
                tmp_dir,
                DeleteOptions {
                    recursive: true,
                    immediate: true,
                },
            )
        }))
        .await;
    }

    // ------------------------------------------------------------------
    // GET

    async fn get_object_inner(
        &self,
        bucket: &str,
        object: &str,
        range: Option<(u64, u64)>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        ObjectKey::validate(object)?;

        let lock = self.ns_lock(bucket, object);
        if !opts.no_lock && !lock.rlock("get-object", &self.lock_options()).await {
            return Err(Error::LockTimeout(format!("{bucket}/{object}")));
        }
        let res = self
            .get_object_locked(bucket, object, range, writer, opts)
            .await;
        if !opts.no_lock {
            lock.runlock().await;
        }
        res
    }

    async fn get_object_locked(
        &self,
        bucket: &str,
        object: &str,
        range: Option<(u64, u64)>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        let (canonical, metas, in_group) = self
            .resolve_object(bucket, object, opts.version_id, true, opts.incl_free_versions)
            .await?;

        if canonical.deleted {
            return Err(if opts.version_id.is_some() {
                Error::MethodNotAllowed
            } else {
                Error::object_not_found(bucket, object)
            });
        }

        let erasure = Erasure::new(
            canonical.erasure.data_blocks,
            canonical.erasure.parity_blocks,
            canonical.erasure.block_size,
        )?;
        let total = erasure.total_blocks();
        let (drives_by_shard, views_by_shard) = self.shard_views(&metas, &in_group, total);

        let object_size = canonical.size.max(0) as u64;
        let (offset, length) = match range {
            None => (0, object_size),
            Some((off, len)) => {
                if off > object_size {
                    return Err(Error::internal("range start beyond object size"));
                }
                (off, len.min(object_size - off))
            }
        };

        // Walk the part table to the requested byte range.
        let mut part_start = 0u64;
        let mut remaining = length;
        let mut cursor = offset;
        for part in &canonical.parts {
            let part_size = part.size.max(0) as u64;
            let part_end = part_start + part_size;
            if remaining == 0 {
                break;
            }
            if cursor >= part_end {
                part_start = part_end;
                continue;
            }
            let in_part_off = cursor - part_start;
            let in_part_len = remaining.min(part_size - in_part_off);

            let shard_len = erasure.shard_file_size(part_size as usize);
            let shards = erasure_io::gather_shards(
                &drives_by_shard,
                &views_by_shard,
                bucket,
                object,
                part.number,
                shard_len,
            )
            .await;

            let written = erasure_io::decode_range(
                &erasure,
                &shards,
                part_size as usize,
                in_part_off,
                in_part_len,
                writer,
            )
            .await
            .map_err(|e| match e {
                Error::InsufficientShards { have, need } => {
                    error!(bucket, object, part = part.number, have, need, "read below data quorum");
                    Error::ReadQuorum { have, want: need }
                }
                other => other,
            })?;

            cursor += written;
            remaining -= written;
            part_start = part_end;
        }

        Ok(ObjectInfo::from_file_info(&canonical, bucket))
    }

    async fn get_object_info_inner(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        ObjectKey::validate(object)?;
        let lock = self.ns_lock(bucket, object);
        if !opts.no_lock && !lock.rlock("get-object-info", &self.lock_options()).await {
            return Err(Error::LockTimeout(format!("{bucket}/{object}")));
        }
        let res = self
            .resolve_object(bucket, object, opts.version_id, false, opts.incl_free_versions)
            .await;
        if !opts.no_lock {
            lock.runlock().await;
        }
        let (canonical, _, _) = res?;
        if canonical.deleted && opts.version_id.is_none() {
            return Err(Error::object_not_found(bucket, object));
        }
        Ok(ObjectInfo::from_file_info(&canonical, bucket))
    }

    // ------------------------------------------------------------------
    // DELETE

    async fn delete_object_inner(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<DeleteResult> {
        ObjectKey::validate(object)?;
        self.check_bucket_exists(bucket).await?;

        let lock = self.ns_lock(bucket, object);
        if !opts.no_lock && !lock.lock("delete-object", &self.lock_options()).await {
            return Err(Error::LockTimeout(format!("{bucket}/{object}")));
        }
        let res = self.delete_object_locked(bucket, object, opts).await;
        if !opts.no_lock {
            lock.unlock().await;
        }
        res
    }

    async fn delete_object_locked(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<DeleteResult> {
        let write_quorum = self.config.write_quorum();

        // Versioned delete without a version id appends a marker.
        if opts.versioned && opts.version_id.is_none() {
            let mut marker = FileInfo::new(bucket, object);
            marker.deleted = true;
            marker.version_id = Some(Uuid::new_v4());
            marker.mod_time = opts.mod_time.unwrap_or_else(now_ns);

            let results = join_all(
                self.drives
                    .iter()
                    .map(|d| d.delete_version(bucket, object, marker.clone())),
            )
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
                return Err(err);
            }
            return Ok(DeleteResult {
                version_id: marker.version_id,
                delete_marker: true,
                is_empty: false,
            });
        }

        // Targeted (or unversioned latest) removal. The quorum honors
        // the parity the version was written with.
        let (canonical, _, _) = self
            .resolve_object(bucket, object, opts.version_id, false, true)
            .await?;
        let (_, write_quorum) = object_quorums(&canonical, self.config.drive_count());

        let results = join_all(
            self.drives
                .iter()
                .map(|d| d.delete_version(bucket, object, canonical.clone())),
        )
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
            return Err(err);
        }

        let is_empty = matches!(
            self.read_all_fileinfo(bucket, object, None, false, true).await,
            (_, errs) if errs.iter().filter(|e| matches!(e, Some(e) if e.is_not_found())).count()
                >= self.config.read_quorum()
        );

        Ok(DeleteResult {
            version_id: canonical.version_id,
            delete_marker: false,
            is_empty,
        })
    }
}

/// Tees bytes through a content hasher while reading.
pub(crate) struct TeeReader<'a> {
    inner: &'a mut (dyn AsyncRead + Send + Unpin),
    hasher: &'a mut Md5,
}

impl<'a> TeeReader<'a> {
    pub(crate) fn new(
        inner: &'a mut (dyn AsyncRead + Send + Unpin),
        hasher: &'a mut Md5,
    ) -> Self {
        Self { inner, hasher }
    }
}

impl tokio::io::AsyncRead for TeeReader<'_> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let me = &mut *self;
        match std::pin::Pin::new(&mut *me.inner).poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(())) => {
                me.hasher.update(&buf.filled()[before..]);
                std::task::Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[async_trait]
impl ObjectLayer for ErasureSet {
    async fn make_bucket(&self, bucket: &str) -> Result<()> {
        self.make_bucket_inner(bucket).await
    }

    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo> {
        self.get_bucket_info_inner(bucket).await
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        self.list_buckets_inner().await
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.delete_bucket_inner(bucket).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        data: PutObjReader,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        self.put_object_inner(bucket, object, data, opts).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        range: Option<(u64, u64)>,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        self.get_object_inner(bucket, object, range, writer, opts).await
    }

    async fn get_object_info(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        self.get_object_info_inner(bucket, object, opts).await
    }

    async fn delete_object(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<DeleteResult> {
        self.delete_object_inner(bucket, object, opts).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        delimiter: Option<&str>,
        max_keys: usize,
    ) -> Result<crate::api::ListObjectsInfo> {
        self.list_objects_inner(bucket, prefix, marker, delimiter, max_keys, false)
            .await
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> Result<crate::api::ListObjectsInfo> {
        self.list_objects_inner(bucket, prefix, marker, None, max_keys, true)
            .await
    }

    async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<crate::api::MultipartInfo> {
        self.new_multipart_upload_inner(bucket, object, opts).await
    }

    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: usize,
        data: PutObjReader,
    ) -> Result<crate::api::PartInfo> {
        self.put_object_part_inner(bucket, object, upload_id, part_number, data)
            .await
    }

    async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_marker: usize,
        max_parts: usize,
    ) -> Result<Vec<crate::api::PartInfo>> {
        self.list_object_parts_inner(bucket, object, upload_id, part_marker, max_parts)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<crate::api::CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        self.complete_multipart_upload_inner(bucket, object, upload_id, parts, opts)
            .await
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.abort_multipart_upload_inner(bucket, object, upload_id).await
    }

    async fn heal_object(
        &self,
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        opts: &crate::api::HealOpts,
    ) -> Result<crate::api::HealResultItem> {
        self.heal_object_inner(bucket, object, version_id, opts).await
    }

    async fn heal_bucket(
        &self,
        bucket: &str,
        opts: &crate::api::HealOpts,
    ) -> Result<crate::api::HealResultItem> {
        self.heal_bucket_inner(bucket, opts).await
    }
}
