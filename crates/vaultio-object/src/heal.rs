//! Object healing: reconcile drive contents after partial failures.
//!
//! Per-object heal classifies every drive, reconstructs the shards of
//! outdated, missing or corrupt drives from the healthy majority, and
//! commits them through the same staged-rename path as a write. An
//! object whose metadata survives on fewer than read-quorum drives is
//! dangling; past the parity threshold it is purged.

use crate::api::{DriveState, HealDriveState, HealOpts, HealResultItem};
use crate::erasure_io;
use crate::quorum::find_file_info_in_quorum;
use crate::store::ErasureSet;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use vaultio_common::{Error, HealScanMode, Result, RESERVED_BUCKET, RESERVED_TMP};
use vaultio_disk::{DeleteOptions, Drive, ReadOptions};
use vaultio_erasure::{BitrotAlgorithm, Erasure};
use vaultio_meta::{ChecksumInfo, FileInfo};

fn classify_read(err: &Error) -> DriveState {
    if err.is_corruption() {
        DriveState::Corrupt
    } else if err.is_not_found() {
        DriveState::Missing
    } else {
        DriveState::Offline
    }
}

impl ErasureSet {
    pub(crate) async fn heal_bucket_inner(
        &self,
        bucket: &str,
        opts: &HealOpts,
    ) -> Result<HealResultItem> {
        let results = join_all(self.drives().iter().map(|d| d.stat_vol(bucket))).await;

        let mut result = HealResultItem {
            bucket: bucket.to_string(),
            ..Default::default()
        };
        let mut missing = Vec::new();
        for (i, res) in results.iter().enumerate() {
            let state = match res {
                Ok(_) => DriveState::Ok,
                Err(e) if e.is_not_found() => {
                    missing.push(i);
                    DriveState::Missing
                }
                Err(_) => DriveState::Offline,
            };
            result.before.push(HealDriveState {
                endpoint: self.drives()[i].endpoint(),
                state,
            });
        }

        let present = results.iter().filter(|r| r.is_ok()).count();
        if present < self.config().read_quorum() {
            return Err(Error::BucketNotFound(bucket.to_string()));
        }

        result.disks_to_heal = missing.len();
        result.after = result.before.clone();
        if opts.dry_run || missing.is_empty() {
            return Ok(result);
        }

        for &i in &missing {
            match self.drives()[i].make_vol(bucket).await {
                Ok(()) | Err(Error::VolumeExists(_)) => {
                    result.after[i].state = DriveState::Ok;
                }
                Err(e) => {
                    warn!(bucket, drive = %self.drives()[i].endpoint(), error = %e, "bucket heal failed");
                }
            }
        }
        Ok(result)
    }

    pub(crate) async fn heal_object_inner(
        &self,
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        opts: &HealOpts,
    ) -> Result<HealResultItem> {
        let lock = self.ns_lock(bucket, object);
        if !opts.no_lock && !lock.lock("heal-object", &self.lock_options()).await {
            return Err(Error::LockTimeout(format!("{bucket}/{object}")));
        }
        let res = self
            .heal_object_locked(bucket, object, version_id, opts)
            .await;
        if !opts.no_lock {
            lock.unlock().await;
        }
        res
    }

    async fn heal_object_locked(
        &self,
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        opts: &HealOpts,
    ) -> Result<HealResultItem> {
        let drives = self.drives();
        let read_quorum = self.config().read_quorum();
        let parity = self.config().parity_blocks;

        let results = join_all(drives.iter().map(|d| {
            d.read_version(
                bucket,
                object,
                version_id,
                ReadOptions {
                    read_data: true,
                    incl_free_versions: false,
                },
            )
        }))
        .await;

        let mut metas: Vec<Option<FileInfo>> = Vec::with_capacity(drives.len());
        let mut states: Vec<DriveState> = Vec::with_capacity(drives.len());
        for res in &results {
            match res {
                Ok(fi) => {
                    metas.push(Some(fi.clone()));
                    states.push(DriveState::Ok);
                }
                Err(e) => {
                    metas.push(None);
                    states.push(classify_read(e));
                }
            }
        }

        let valid = metas.iter().filter(|m| m.is_some()).count();
        let missing = states.iter().filter(|s| **s == DriveState::Missing).count();

        // Dangling: not enough surviving metadata to act on. Past the
        // parity threshold the object is unrecoverable and may be
        // purged; below it the metadata loss may still be transient.
        if valid < read_quorum {
            if missing > parity {
                if opts.remove && !opts.dry_run {
                    let mut result =
                        self.heal_result_skeleton(bucket, object, version_id, &states);
                    info!(bucket, object, missing, parity, "purging dangling object");
                    join_all(drives.iter().map(|d| {
                        d.delete(
                            bucket,
                            object,
                            DeleteOptions {
                                recursive: true,
                                immediate: true,
                            },
                        )
                    }))
                    .await;
                    for s in &mut result.after {
                        s.state = DriveState::Missing;
                    }
                    return Ok(result);
                }
                return Err(Error::DanglingObject);
            }
            return Err(Error::ReadQuorum {
                have: valid,
                want: read_quorum,
            });
        }

        let (canonical, in_group) = find_file_info_in_quorum(&metas, read_quorum)?;

        // Valid-but-disagreeing metadata means the drive lags the
        // quorum's latest write.
        for (i, state) in states.iter_mut().enumerate() {
            if *state == DriveState::Ok && !in_group[i] {
                *state = DriveState::Outdated;
            }
        }

        // The request may deepen the configured scan, never shallow it.
        let scan_mode = match (self.config().heal_scan_mode, opts.scan_mode) {
            (HealScanMode::Deep, _) | (_, HealScanMode::Deep) => HealScanMode::Deep,
            _ => HealScanMode::Normal,
        };

        // Delete markers carry no shards; agreement is all there is.
        if !canonical.deleted {
            // Part inspection on the agreeing drives.
            for (i, drive) in drives.iter().enumerate() {
                if states[i] != DriveState::Ok {
                    continue;
                }
                let fi = metas[i].as_ref().expect("agreeing drive has metadata");
                let check = match scan_mode {
                    HealScanMode::Normal => drive.check_parts(bucket, object, fi).await,
                    HealScanMode::Deep => drive.verify_file(bucket, object, fi).await,
                };
                match check {
                    Ok(resp) if resp.all_ok() => {}
                    Ok(resp) => {
                        let corrupt = resp
                            .results
                            .iter()
                            .any(|r| *r == vaultio_disk::PartCheck::Corrupt);
                        states[i] = if corrupt {
                            DriveState::Corrupt
                        } else {
                            DriveState::Missing
                        };
                    }
                    Err(e) => {
                        warn!(drive = %drive.endpoint(), error = %e, "part check failed");
                        states[i] = DriveState::Offline;
                    }
                }
            }
        }

        let mut result = self.heal_result_skeleton(bucket, object, canonical.version_id, &states);
        result.object_size = canonical.size;
        result.data_blocks = canonical.erasure.data_blocks;
        result.parity_blocks = canonical.erasure.parity_blocks;

        let targets: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(
                    s,
                    DriveState::Missing | DriveState::Corrupt | DriveState::Outdated
                )
            })
            .map(|(i, _)| i)
            .collect();
        result.disks_to_heal = targets.len();

        if targets.is_empty() || opts.dry_run {
            return Ok(result);
        }

        if canonical.deleted || canonical.size == 0 || canonical.inline_data() {
            self.heal_metadata_only(bucket, object, &canonical, &metas, &in_group, &targets, &mut result)
                .await?;
        } else {
            self.heal_shards(bucket, object, &canonical, &metas, &in_group, &states, &targets, &mut result)
                .await?;
        }

        Ok(result)
    }

    fn heal_result_skeleton(
        &self,
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        states: &[DriveState],
    ) -> HealResultItem {
        let before: Vec<HealDriveState> = self
            .drives()
            .iter()
            .zip(states.iter())
            .map(|(d, s)| HealDriveState {
                endpoint: d.endpoint(),
                state: *s,
            })
            .collect();
        HealResultItem {
            bucket: bucket.to_string(),
            object: object.to_string(),
            version_id,
            before: before.clone(),
            after: before,
            ..Default::default()
        }
    }

    /// Heal paths with no part files to rebuild: delete markers,
    /// zero-byte versions and inline versions. The canonical metadata
    /// (with per-drive shard identity for inline data) is replayed onto
    /// each target drive.
    #[allow(clippy::too_many_arguments)]
    async fn heal_metadata_only(
        &self,
        bucket: &str,
        object: &str,
        canonical: &FileInfo,
        metas: &[Option<FileInfo>],
        in_group: &[bool],
        targets: &[usize],
        result: &mut HealResultItem,
    ) -> Result<()> {
        let inline = canonical.inline_data() && !canonical.deleted;
        let algo = BitrotAlgorithm::default();

        // Rebuild inline shards once when any target needs them.
        let shards: Option<Vec<Option<Vec<u8>>>> = if inline {
            let erasure = Erasure::new(
                canonical.erasure.data_blocks,
                canonical.erasure.parity_blocks,
                canonical.erasure.block_size,
            )?;
            let total = erasure.total_blocks();
            let (_, views) = self.shard_views(metas, in_group, total);
            let part = canonical.parts.first().cloned().unwrap_or_default();
            let mut shards = erasure_io::gather_shards(
                &vec![None; total],
                &views,
                bucket,
                object,
                part.number,
                0,
            )
            .await;
            erasure_io::reconstruct_all(&erasure, &mut shards)?;
            Some(shards)
        } else {
            None
        };

        for &i in targets {
            let drive = &self.drives()[i];
            let shard_idx = canonical
                .erasure
                .distribution
                .get(i)
                .map(|s| *s as usize)
                .unwrap_or(canonical.erasure.index);

            let mut fi = canonical.clone();
            fi.erasure.index = shard_idx;
            if let Some(shards) = &shards {
                let Some(shard) = shards.get(shard_idx - 1).cloned().flatten() else {
                    continue;
                };
                let part_number = canonical.parts.first().map_or(1, |p| p.number);
                let mut hasher = algo.hasher();
                hasher.update(&shard);
                fi.erasure.checksums = vec![ChecksumInfo {
                    part_number,
                    algorithm: algo,
                    hash: hasher.finalize(),
                }];
                fi.data = Some(shard);
            }

            // write_metadata replays the version (marker or inline)
            // into the target's xl.meta, creating it when absent.
            match drive.write_metadata(bucket, object, fi).await {
                Ok(()) => {
                    result.after[i].state = DriveState::Ok;
                }
                Err(e) => {
                    warn!(drive = %drive.endpoint(), error = %e, "metadata heal failed");
                }
            }
        }
        Ok(())
    }

    /// Reconstruct part files for the target drives and commit them via
    /// the staged-rename path.
    #[allow(clippy::too_many_arguments)]
    async fn heal_shards(
        &self,
        bucket: &str,
        object: &str,
        canonical: &FileInfo,
        metas: &[Option<FileInfo>],
        in_group: &[bool],
        states: &[DriveState],
        targets: &[usize],
        result: &mut HealResultItem,
    ) -> Result<()> {
        let erasure = Erasure::new(
            canonical.erasure.data_blocks,
            canonical.erasure.parity_blocks,
            canonical.erasure.block_size,
        )?;
        let total = erasure.total_blocks();
        let algo = BitrotAlgorithm::default();
        let data_dir = canonical
            .data_dir
            .ok_or_else(|| Error::internal("object version without data dir"))?;

        // Source shards come only from drives that are fully healthy.
        let mut source_mask = in_group.to_vec();
        for (i, state) in states.iter().enumerate() {
            if *state != DriveState::Ok {
                source_mask[i] = false;
            }
        }
        let (src_drives, src_views) = self.shard_views(metas, &source_mask, total);

        let tmp_id = Uuid::new_v4();
        let tmp_dir = format!("{RESERVED_TMP}/{tmp_id}");

        // Per-target running digests, one per part in table order.
        let mut digests: Vec<Vec<ChecksumInfo>> = vec![Vec::new(); targets.len()];

        for part in &canonical.parts {
            let shard_len = erasure.shard_file_size(part.size.max(0) as usize);
            let mut shards = erasure_io::gather_shards(
                &src_drives,
                &src_views,
                bucket,
                object,
                part.number,
                shard_len,
            )
            .await;
            if let Err(e) = erasure_io::reconstruct_all(&erasure, &mut shards) {
                self.cleanup_tmp(&tmp_dir).await;
                return Err(e);
            }

            let tmp_part = format!("{tmp_dir}/{data_dir}/part.{}", part.number);
            let writes = join_all(targets.iter().enumerate().map(|(t, &i)| {
                let shard_idx = canonical.erasure.distribution[i] as usize;
                let shard = shards
                    .get(shard_idx - 1)
                    .cloned()
                    .flatten()
                    .unwrap_or_default();
                let drive = Arc::clone(&self.drives()[i]);
                let tmp_part = tmp_part.clone();
                async move {
                    let mut hasher = algo.hasher();
                    hasher.update(&shard);
                    let sum = hasher.finalize();
                    drive
                        .append_file(RESERVED_BUCKET, &tmp_part, Bytes::from(shard))
                        .await
                        .map(|()| (t, sum))
                }
            }))
            .await;

            for res in writes {
                match res {
                    Ok((t, sum)) => digests[t].push(ChecksumInfo {
                        part_number: part.number,
                        algorithm: algo,
                        hash: sum,
                    }),
                    Err(e) => {
                        warn!(bucket, object, error = %e, "heal shard write failed");
                    }
                }
            }
        }

        // Commit each healed drive.
        for (t, &i) in targets.iter().enumerate() {
            if digests[t].len() != canonical.parts.len() {
                continue;
            }
            let drive = &self.drives()[i];
            let shard_idx = canonical.erasure.distribution[i] as usize;
            let mut fi = canonical.clone();
            fi.erasure.index = shard_idx;
            fi.erasure.checksums = digests[t].clone();
            fi.data = None;

            match drive
                .rename_data(RESERVED_BUCKET, &tmp_dir, fi, bucket, object)
                .await
            {
                Ok(_) => {
                    result.after[i].state = DriveState::Ok;
                    info!(
                        bucket,
                        object,
                        drive = %drive.endpoint(),
                        from = %result.before[i].state,
                        "drive healed"
                    );
                }
                Err(e) => {
                    warn!(drive = %drive.endpoint(), error = %e, "heal commit failed");
                }
            }
        }

        self.cleanup_tmp(&tmp_dir).await;
        Ok(())
    }
}
