//! Local drive: typed file I/O over one directory tree
//!
//! Layout per drive:
//!
//! ```text
//! <root>/<bucket>/<object>/xl.meta
//! <root>/<bucket>/<object>/<data-dir-uuid>/part.<n>
//! <root>/.vaultio.sys/tmp/<tmp-uuid>/...          staging for atomic renames
//! ```
//!
//! Every mutation is staged and committed with a rename so a crashed
//! writer never leaves a torn file behind.

use crate::api::{
    CheckPartsResp, DeleteOptions, Drive, FileProps, MetaCacheEntry, PartCheck, RawFileInfo,
    ReadOptions, RenameDataResp, VolInfo, WalkDirOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;
use vaultio_common::{
    BucketName, Error, Result, META_FILE, RESERVED_BUCKET, RESERVED_TMP,
};
use vaultio_erasure::BitrotVerifier;
use vaultio_meta::{FileInfo, FileMeta};

/// One local drive rooted at a directory.
#[derive(Debug)]
pub struct LocalDrive {
    root: PathBuf,
    online: AtomicBool,
}

fn file_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound,
        io::ErrorKind::PermissionDenied => Error::DriveAccessDenied,
        _ => Error::DriveIo(e),
    }
}

fn validate_rel_path(path: &str) -> Result<()> {
    if path.len() > 4096 {
        return Err(Error::PathTooLong);
    }
    if path.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(Error::InvalidObjectKey(
            vaultio_common::ObjectKeyError::InvalidSegment,
        ));
    }
    Ok(())
}

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

impl LocalDrive {
    /// Open (and initialize) a drive rooted at `root`. Creates the root
    /// and the reserved staging namespace when missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RESERVED_BUCKET).join(RESERVED_TMP))
            .await
            .map_err(Error::DriveIo)?;
        Ok(Self {
            root,
            online: AtomicBool::new(true),
        })
    }

    /// Drive root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::DriveOffline)
        }
    }

    /// Record a result, flipping the drive offline on fatal errors.
    fn track<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_drive_fatal() {
                warn!(drive = %self.root.display(), error = %e, "marking drive offline");
                self.online.store(false, Ordering::SeqCst);
            }
        }
        res
    }

    fn vol_path(&self, volume: &str) -> Result<PathBuf> {
        if volume.is_empty() || volume.contains('/') || volume.contains('\\') {
            return Err(Error::VolumeNotFound(volume.to_string()));
        }
        Ok(self.root.join(volume))
    }

    fn file_path(&self, volume: &str, path: &str) -> Result<PathBuf> {
        validate_rel_path(path)?;
        Ok(self.vol_path(volume)?.join(path))
    }

    async fn check_vol(&self, volume: &str) -> Result<PathBuf> {
        let dir = self.vol_path(volume)?;
        match fs::metadata(&dir).await {
            Ok(md) if md.is_dir() => Ok(dir),
            Ok(_) => Err(Error::VolumeNotFound(volume.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::VolumeNotFound(volume.to_string()))
            }
            Err(e) => Err(Error::DriveIo(e)),
        }
    }

    /// Write into a unique staging file, fsync, then rename into place.
    async fn atomic_write(&self, dst: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await.map_err(file_err)?;
        }
        let tmp = self
            .root
            .join(RESERVED_BUCKET)
            .join(RESERVED_TMP)
            .join(Uuid::new_v4().to_string());
        let mut f = fs::File::create(&tmp).await.map_err(file_err)?;
        f.write_all(data).await.map_err(file_err)?;
        f.sync_all().await.map_err(file_err)?;
        drop(f);
        if let Err(e) = fs::rename(&tmp, dst).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(file_err(e));
        }
        Ok(())
    }

    /// Remove now-empty parent directories up to (not including) `stop`.
    async fn prune_empty_parents(&self, from: &Path, stop: &Path) {
        let mut cur = from.parent().map(Path::to_path_buf);
        while let Some(dir) = cur {
            if dir == *stop || !dir.starts_with(stop) {
                break;
            }
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            cur = dir.parent().map(Path::to_path_buf);
        }
    }

    async fn read_meta(&self, volume: &str, path: &str) -> Result<FileMeta> {
        let buf = self.read_all(volume, &join_path(path, META_FILE)).await?;
        if !vaultio_meta::is_xl2_format(&buf) {
            return Err(Error::FileCorrupt);
        }
        FileMeta::load(&buf)
    }

    async fn write_meta(&self, volume: &str, path: &str, meta: &FileMeta) -> Result<()> {
        let buf = meta.marshal()?;
        self.write_all(volume, &join_path(path, META_FILE), Bytes::from(buf))
            .await
    }

    fn walk<'a>(
        &'a self,
        opts: &'a WalkDirOptions,
        dir: String,
        tx: &'a mpsc::Sender<MetaCacheEntry>,
        emitted: &'a mut usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let vol_dir = self.vol_path(&opts.bucket)?;
            let abs = if dir.is_empty() {
                vol_dir.clone()
            } else {
                vol_dir.join(&dir)
            };

            let mut names = Vec::new();
            let mut rd = match fs::read_dir(&abs).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(Error::DriveIo(e)),
            };
            while let Some(entry) = rd.next_entry().await.map_err(Error::DriveIo)? {
                let md = entry.metadata().await.map_err(Error::DriveIo)?;
                if md.is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
            names.sort();

            for name in names {
                // Data directories are reachable only through xl.meta.
                if Uuid::parse_str(&name).is_ok() {
                    continue;
                }
                let rel = join_path(&dir, &name);

                if let Some(prefix) = &opts.filter_prefix {
                    let as_dir = format!("{rel}/");
                    if !rel.starts_with(prefix.as_str()) && !prefix.starts_with(as_dir.as_str()) {
                        continue;
                    }
                }

                let meta_path = abs.join(&name).join(META_FILE);
                let is_object = fs::metadata(&meta_path).await.is_ok();

                if is_object {
                    let skip = opts
                        .forward_to
                        .as_deref()
                        .is_some_and(|marker| rel.as_str() < marker);
                    if !skip {
                        let buf = match fs::read(&meta_path).await {
                            Ok(buf) => Bytes::from(buf),
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(Error::DriveIo(e)),
                        };
                        if tx
                            .send(MetaCacheEntry {
                                name: rel.clone(),
                                metadata: buf,
                            })
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                        *emitted += 1;
                        if opts.limit > 0 && *emitted >= opts.limit {
                            return Err(Error::DoneForNow);
                        }
                    }
                    // Objects can nest beneath objects; keep descending.
                    if opts.recursive {
                        self.walk(opts, rel, tx, emitted).await?;
                    }
                    continue;
                }

                if opts.recursive {
                    self.walk(opts, rel, tx, emitted).await?;
                } else {
                    let dir_name = format!("{rel}/");
                    let skip = opts
                        .forward_to
                        .as_deref()
                        .is_some_and(|marker| dir_name.as_str() < marker && !marker.starts_with(&dir_name));
                    if skip {
                        continue;
                    }
                    if tx
                        .send(MetaCacheEntry {
                            name: dir_name,
                            metadata: Bytes::new(),
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                    *emitted += 1;
                    if opts.limit > 0 && *emitted >= opts.limit {
                        return Err(Error::DoneForNow);
                    }
                }
            }
            Ok(())
        })
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn systime_nanos(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl Drive for LocalDrive {
    fn endpoint(&self) -> String {
        self.root.display().to_string()
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    async fn make_vol(&self, volume: &str) -> Result<()> {
        self.check_online()?;
        if volume != RESERVED_BUCKET {
            BucketName::validate(volume)?;
        }
        let dir = self.vol_path(volume)?;
        match fs::create_dir(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::VolumeExists(volume.to_string()))
            }
            Err(e) => self.track(Err(file_err(e))),
        }
    }

    async fn stat_vol(&self, volume: &str) -> Result<VolInfo> {
        self.check_online()?;
        let dir = self.check_vol(volume).await?;
        let md = fs::metadata(&dir).await.map_err(file_err)?;
        let created = md
            .created()
            .or_else(|_| md.modified())
            .map(systime_nanos)
            .unwrap_or_default();
        Ok(VolInfo {
            name: volume.to_string(),
            created,
        })
    }

    async fn delete_vol(&self, volume: &str, force: bool) -> Result<()> {
        self.check_online()?;
        let dir = self.check_vol(volume).await?;
        let res = if force {
            fs::remove_dir_all(&dir).await
        } else {
            fs::remove_dir(&dir).await
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::VolumeNotFound(volume.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                Err(Error::VolumeNotEmpty(volume.to_string()))
            }
            Err(e) => Err(file_err(e)),
        }
    }

    async fn list_vols(&self) -> Result<Vec<VolInfo>> {
        self.check_online()?;
        let mut vols = Vec::new();
        let mut rd = fs::read_dir(&self.root).await.map_err(Error::DriveIo)?;
        while let Some(entry) = rd.next_entry().await.map_err(Error::DriveIo)? {
            let md = entry.metadata().await.map_err(Error::DriveIo)?;
            if !md.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if BucketName::validate(&name).is_err() {
                continue;
            }
            let created = md
                .created()
                .or_else(|_| md.modified())
                .map(systime_nanos)
                .unwrap_or_default();
            vols.push(VolInfo { name, created });
        }
        vols.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vols)
    }

    async fn write_all(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        self.check_online()?;
        self.check_vol(volume).await?;
        let dst = self.file_path(volume, path)?;
        self.track(self.atomic_write(&dst, &data).await)
    }

    async fn append_file(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        self.check_online()?;
        self.check_vol(volume).await?;
        let dst = self.file_path(volume, path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await.map_err(file_err)?;
        }
        let mut f = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&dst)
            .await
            .map_err(file_err)?;
        let res = f.write_all(&data).await.map_err(file_err);
        self.track(res)
    }

    async fn read_all(&self, volume: &str, path: &str) -> Result<Bytes> {
        self.check_online()?;
        self.check_vol(volume).await?;
        let src = self.file_path(volume, path)?;
        match fs::read(&src).await {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(e) => self.track(Err(file_err(e))),
        }
    }

    async fn read_file(&self, volume: &str, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.check_online()?;
        self.check_vol(volume).await?;
        let src = self.file_path(volume, path)?;
        let mut f = fs::File::open(&src).await.map_err(file_err)?;
        f.seek(io::SeekFrom::Start(offset)).await.map_err(file_err)?;
        let mut buf = vec![0u8; length as usize];
        match f.read_exact(&mut buf).await {
            Ok(_) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::FileCorrupt),
            Err(e) => self.track(Err(file_err(e))),
        }
    }

    async fn read_file_with_verify(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        length: u64,
        verifier: &BitrotVerifier,
    ) -> Result<Bytes> {
        let buf = {
            self.check_online()?;
            self.check_vol(volume).await?;
            let src = self.file_path(volume, path)?;
            match fs::read(&src).await {
                Ok(buf) => buf,
                Err(e) => return self.track(Err(file_err(e))),
            }
        };
        verifier.verify(&buf)?;
        let start = (offset as usize).min(buf.len());
        let end = (offset as usize + length as usize).min(buf.len());
        if end - start < length as usize {
            return Err(Error::FileCorrupt);
        }
        Ok(Bytes::copy_from_slice(&buf[start..end]))
    }

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileProps> {
        self.check_online()?;
        self.check_vol(volume).await?;
        let src = self.file_path(volume, path)?;
        let md = fs::metadata(&src).await.map_err(file_err)?;
        Ok(FileProps {
            size: md.len(),
            mod_time: md.modified().map(systime_nanos).unwrap_or_default(),
            is_dir: md.is_dir(),
        })
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()> {
        self.check_online()?;
        self.check_vol(src_volume).await?;
        self.check_vol(dst_volume).await?;
        let src = self.file_path(src_volume, src_path)?;
        let dst = self.file_path(dst_volume, dst_path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await.map_err(file_err)?;
        }
        fs::rename(&src, &dst).await.map_err(file_err)
    }

    async fn rename_data(
        &self,
        src_volume: &str,
        src_path: &str,
        fi: FileInfo,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<RenameDataResp> {
        self.check_online()?;
        let src_vol_dir = self.check_vol(src_volume).await?;
        self.check_vol(dst_volume).await?;

        let src_meta = self.file_path(src_volume, &join_path(src_path, META_FILE))?;
        let dst_meta = self.file_path(dst_volume, &join_path(dst_path, META_FILE))?;

        // Load the previous destination metadata, tolerating a fresh
        // object but not a corrupt one we might clobber silently.
        let mut meta = match fs::read(&dst_meta).await {
            Ok(buf) if vaultio_meta::is_xl2_format(&buf) => FileMeta::load(&buf)?,
            Ok(_) => FileMeta::new(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => FileMeta::new(),
            Err(e) => return self.track(Err(file_err(e))),
        };

        // A replaced version with an unshared data dir must be purged.
        // The incoming version may reuse the same data dir (heal); in
        // that case the directory is swapped in place, not purged.
        let vid = fi.stored_version_id();
        let old_data_dir = meta.find_version(vid).ok().and_then(|(_, ver)| {
            ver.data_dir()
                .filter(|dd| Some(*dd) != fi.data_dir)
                .filter(|dd| meta.shared_data_dir_count(vid, *dd) == 0)
        });
        if let Some(old) = old_data_dir {
            meta.data.remove(vid);
            debug!(
                drive = %self.root.display(),
                version = %vid,
                data_dir = %old,
                "replacing version data dir"
            );
        }

        meta.add_version(&fi)?;
        let merged = meta.marshal()?;

        // Stage the merged metadata next to the staged data, then move
        // the data dir and finally commit the metadata rename.
        self.atomic_write(&src_meta, &merged).await?;

        let inline = fi.data.is_some() || fi.size == 0;
        let moved_dir = match fi.data_dir {
            Some(dd) if !inline => {
                let src_dd = self.file_path(src_volume, &join_path(src_path, &dd.to_string()))?;
                let dst_dd = self.file_path(dst_volume, &join_path(dst_path, &dd.to_string()))?;
                if let Some(parent) = dst_dd.parent() {
                    fs::create_dir_all(parent).await.map_err(file_err)?;
                }
                // Replacing the same data dir (heal) swaps the staged
                // copy over whatever remains of the old one.
                let _ = fs::remove_dir_all(&dst_dd).await;
                fs::rename(&src_dd, &dst_dd).await.map_err(file_err)?;
                Some(dst_dd)
            }
            _ => None,
        };

        if let Some(parent) = dst_meta.parent() {
            fs::create_dir_all(parent).await.map_err(file_err)?;
        }
        if let Err(e) = fs::rename(&src_meta, &dst_meta).await {
            if let Some(dst_dd) = moved_dir {
                let _ = fs::remove_dir_all(&dst_dd).await;
            }
            return self.track(Err(file_err(e)));
        }

        if let Some(old) = old_data_dir {
            let old_dir = self.file_path(dst_volume, &join_path(dst_path, &old.to_string()))?;
            let _ = fs::remove_dir_all(&old_dir).await;
        }

        // Drop the now-empty staging directory.
        let src_dir = self.file_path(src_volume, src_path)?;
        let _ = fs::remove_dir_all(&src_dir).await;
        self.prune_empty_parents(&src_dir, &src_vol_dir).await;

        Ok(RenameDataResp { old_data_dir })
    }

    async fn delete(&self, volume: &str, path: &str, opts: DeleteOptions) -> Result<()> {
        self.check_online()?;
        let vol_dir = self.check_vol(volume).await?;
        let target = self.file_path(volume, path)?;
        let md = match fs::metadata(&target).await {
            Ok(md) => md,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(file_err(e)),
        };
        let res = if md.is_dir() {
            if opts.recursive {
                fs::remove_dir_all(&target).await
            } else {
                fs::remove_dir(&target).await
            }
        } else {
            fs::remove_file(&target).await
        };
        if let Err(e) = res {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(file_err(e));
            }
        }
        self.prune_empty_parents(&target, &vol_dir).await;
        Ok(())
    }

    async fn write_metadata(&self, volume: &str, path: &str, fi: FileInfo) -> Result<()> {
        self.check_online()?;
        let mut meta = match self.read_meta(volume, path).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => FileMeta::new(),
            Err(e) => return Err(e),
        };
        meta.add_version(&fi)?;
        self.write_meta(volume, path, &meta).await
    }

    async fn update_metadata(&self, volume: &str, path: &str, fi: FileInfo) -> Result<()> {
        self.check_online()?;
        let mut meta = self.read_meta(volume, path).await?;
        meta.update_version(&fi)?;
        self.write_meta(volume, path, &meta).await
    }

    async fn read_version(
        &self,
        volume: &str,
        path: &str,
        version_id: Option<Uuid>,
        opts: ReadOptions,
    ) -> Result<FileInfo> {
        self.check_online()?;
        let meta = self.read_meta(volume, path).await?;
        meta.into_fileinfo(volume, path, version_id, opts.read_data, opts.incl_free_versions)
    }

    async fn read_xl(&self, volume: &str, path: &str) -> Result<RawFileInfo> {
        self.check_online()?;
        let buf = self.read_all(volume, &join_path(path, META_FILE)).await?;
        Ok(RawFileInfo { buf })
    }

    async fn delete_version(&self, volume: &str, path: &str, fi: FileInfo) -> Result<()> {
        self.check_online()?;
        let mut meta = match self.read_meta(volume, path).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() && fi.deleted => {
                // First delete under versioning: create the marker.
                let mut meta = FileMeta::new();
                meta.add_version(&fi)?;
                return self.write_meta(volume, path, &meta).await;
            }
            Err(e) => return Err(e),
        };

        let (purge, empty) = meta.delete_version(&fi)?;

        if empty {
            self.delete(
                volume,
                path,
                DeleteOptions {
                    recursive: true,
                    immediate: true,
                },
            )
            .await?;
        } else {
            self.write_meta(volume, path, &meta).await?;
            if let Some(dd) = purge {
                self.delete(
                    volume,
                    &join_path(path, &dd.to_string()),
                    DeleteOptions {
                        recursive: true,
                        immediate: true,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn check_parts(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp> {
        self.check_online()?;
        let mut resp = CheckPartsResp::default();
        if fi.inline_data() {
            resp.results = vec![PartCheck::Ok; fi.parts.len()];
            return Ok(resp);
        }
        let Some(dd) = fi.data_dir else {
            resp.results = vec![PartCheck::Missing; fi.parts.len()];
            return Ok(resp);
        };
        for part in &fi.parts {
            let want = fi.shard_file_size(part.size) as u64;
            let part_path = join_path(path, &format!("{dd}/part.{}", part.number));
            match self.stat_file(volume, &part_path).await {
                Ok(props) => {
                    if props.size == want {
                        resp.results.push(PartCheck::Ok);
                    } else {
                        resp.results.push(PartCheck::SizeMismatch);
                    }
                }
                // A zero-length shard may legitimately have no file.
                Err(e) if e.is_not_found() && want == 0 => resp.results.push(PartCheck::Ok),
                Err(e) if e.is_not_found() => resp.results.push(PartCheck::Missing),
                Err(e) => return Err(e),
            }
        }
        Ok(resp)
    }

    async fn verify_file(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp> {
        self.check_online()?;
        let mut resp = CheckPartsResp::default();
        if fi.inline_data() {
            resp.results = vec![PartCheck::Ok; fi.parts.len()];
            return Ok(resp);
        }
        let Some(dd) = fi.data_dir else {
            resp.results = vec![PartCheck::Missing; fi.parts.len()];
            return Ok(resp);
        };
        for part in &fi.parts {
            let Some(ck) = fi.erasure.checksum(part.number) else {
                resp.results.push(PartCheck::Corrupt);
                continue;
            };
            let verifier = BitrotVerifier::new(ck.algorithm, ck.hash.clone());
            let part_path = join_path(path, &format!("{dd}/part.{}", part.number));
            let size = fi.shard_file_size(part.size) as u64;
            match self
                .read_file_with_verify(volume, &part_path, 0, size, &verifier)
                .await
            {
                Ok(_) => resp.results.push(PartCheck::Ok),
                Err(Error::Corrupt) | Err(Error::FileCorrupt) => {
                    resp.results.push(PartCheck::Corrupt)
                }
                Err(e) if e.is_not_found() && size == 0 => resp.results.push(PartCheck::Ok),
                Err(e) if e.is_not_found() => resp.results.push(PartCheck::Missing),
                Err(e) => return Err(e),
            }
        }
        Ok(resp)
    }

    async fn list_dir(&self, volume: &str, dir_path: &str, count: usize) -> Result<Vec<String>> {
        self.check_online()?;
        self.check_vol(volume).await?;
        let dir = self.file_path(volume, dir_path)?;
        let mut names = Vec::new();
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::FileNotFound),
            Err(e) => return Err(Error::DriveIo(e)),
        };
        while let Some(entry) = rd.next_entry().await.map_err(Error::DriveIo)? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let md = entry.metadata().await.map_err(Error::DriveIo)?;
            if md.is_dir() {
                names.push(format!("{name}/"));
            } else {
                names.push(name);
            }
        }
        names.sort();
        if count > 0 {
            names.truncate(count);
        }
        Ok(names)
    }

    async fn walk_dir(
        &self,
        opts: WalkDirOptions,
        tx: mpsc::Sender<MetaCacheEntry>,
    ) -> Result<()> {
        self.check_online()?;
        self.check_vol(&opts.bucket).await?;
        let mut emitted = 0usize;
        let base = opts.base_dir.trim_end_matches('/').to_string();
        match self.walk(&opts, base, &tx, &mut emitted).await {
            Ok(()) => Ok(()),
            // Limit reached is normal termination for a streaming walk.
            Err(Error::DoneForNow) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultio_meta::{ChecksumInfo, ErasureAlgo, ErasureInfo, ObjectPartInfo};

    async fn new_drive() -> (tempfile::TempDir, LocalDrive) {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalDrive::open(dir.path()).await.unwrap();
        (dir, drive)
    }

    fn sample_fi(size: i64) -> FileInfo {
        let mut fi = FileInfo::new("bucket", "obj");
        fi.version_id = Some(Uuid::new_v4());
        fi.data_dir = Some(Uuid::new_v4());
        fi.mod_time = 1_000;
        fi.size = size;
        fi.parts.push(ObjectPartInfo {
            number: 1,
            size,
            actual_size: size,
            etag: None,
        });
        fi.erasure = ErasureInfo {
            algorithm: ErasureAlgo::ReedSolomon,
            data_blocks: 2,
            parity_blocks: 2,
            block_size: 1 << 20,
            index: 1,
            distribution: vec![1, 2, 3, 4],
            checksums: vec![ChecksumInfo {
                part_number: 1,
                algorithm: vaultio_erasure::BitrotAlgorithm::HighwayHash256,
                hash: Vec::new(),
            }],
        };
        fi
    }

    #[tokio::test]
    async fn test_vol_lifecycle() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        assert!(matches!(
            drive.make_vol("bucket").await,
            Err(Error::VolumeExists(_))
        ));
        let info = drive.stat_vol("bucket").await.unwrap();
        assert_eq!(info.name, "bucket");

        let vols = drive.list_vols().await.unwrap();
        assert_eq!(vols.len(), 1);

        drive.delete_vol("bucket", false).await.unwrap();
        assert!(matches!(
            drive.stat_vol("bucket").await,
            Err(Error::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_vols_skips_reserved() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        let vols = drive.list_vols().await.unwrap();
        assert!(vols.iter().all(|v| v.name != RESERVED_BUCKET));
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        drive
            .write_all("bucket", "a/b/file", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let buf = drive.read_all("bucket", "a/b/file").await.unwrap();
        assert_eq!(&buf[..], b"hello");

        let window = drive.read_file("bucket", "a/b/file", 1, 3).await.unwrap();
        assert_eq!(&window[..], b"ell");
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        assert!(matches!(
            drive.read_all("bucket", "nope").await,
            Err(Error::FileNotFound)
        ));
        assert!(matches!(
            drive.read_all("missing-vol", "nope").await,
            Err(Error::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        drive
            .delete("bucket", "not/there", DeleteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_parents() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        drive
            .write_all("bucket", "deep/nested/file", Bytes::from_static(b"x"))
            .await
            .unwrap();
        drive
            .delete("bucket", "deep/nested/file", DeleteOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            drive.stat_file("bucket", "deep").await,
            Err(Error::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_rename_data_commit_and_replace() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();

        let fi = sample_fi(8);
        let dd = fi.data_dir.unwrap();
        let staging = format!("{}/{}", RESERVED_TMP, Uuid::new_v4());
        drive
            .append_file(
                RESERVED_BUCKET,
                &format!("{staging}/{dd}/part.1"),
                Bytes::from_static(b"shard-01"),
            )
            .await
            .unwrap();

        drive
            .rename_data(RESERVED_BUCKET, &staging, fi.clone(), "bucket", "obj")
            .await
            .unwrap();

        let got = drive
            .read_version("bucket", "obj", None, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(got.version_id, fi.version_id);
        let shard = drive
            .read_all("bucket", &format!("obj/{dd}/part.1"))
            .await
            .unwrap();
        assert_eq!(&shard[..], b"shard-01");

        // Overwriting the same version id replaces its data dir.
        let mut fi2 = fi.clone();
        fi2.data_dir = Some(Uuid::new_v4());
        fi2.mod_time = 2_000;
        let dd2 = fi2.data_dir.unwrap();
        let staging2 = format!("{}/{}", RESERVED_TMP, Uuid::new_v4());
        drive
            .append_file(
                RESERVED_BUCKET,
                &format!("{staging2}/{dd2}/part.1"),
                Bytes::from_static(b"shard-02"),
            )
            .await
            .unwrap();
        let resp = drive
            .rename_data(RESERVED_BUCKET, &staging2, fi2, "bucket", "obj")
            .await
            .unwrap();
        assert_eq!(resp.old_data_dir, Some(dd));
        assert!(matches!(
            drive.stat_file("bucket", &format!("obj/{dd}")).await,
            Err(Error::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_version_last_removes_object() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();

        let mut fi = sample_fi(0);
        fi.data = Some(b"inline".to_vec());
        fi.set_inline_data();
        drive.write_metadata("bucket", "obj", fi.clone()).await.unwrap();

        drive.delete_version("bucket", "obj", fi).await.unwrap();
        assert!(matches!(
            drive
                .read_version("bucket", "obj", None, ReadOptions::default())
                .await,
            Err(Error::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_read_xl_raw() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();

        let mut fi = sample_fi(0);
        fi.data = Some(b"x".to_vec());
        fi.set_inline_data();
        drive.write_metadata("bucket", "obj", fi).await.unwrap();

        let raw = drive.read_xl("bucket", "obj").await.unwrap();
        assert!(vaultio_meta::is_xl2_format(&raw.buf));
        assert!(matches!(
            drive.read_xl("bucket", "nope").await,
            Err(Error::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_metadata_in_place() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();

        let mut fi = sample_fi(0);
        fi.data = Some(b"inline".to_vec());
        fi.set_inline_data();
        drive.write_metadata("bucket", "obj", fi.clone()).await.unwrap();

        fi.metadata
            .insert("content-type".to_string(), "text/plain".to_string());
        drive.update_metadata("bucket", "obj", fi.clone()).await.unwrap();

        let got = drive
            .read_version("bucket", "obj", None, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(
            got.metadata.get("content-type").map(String::as_str),
            Some("text/plain")
        );
        // Erasure parameters and mod-time are untouched by the update.
        assert_eq!(got.mod_time, fi.mod_time);
        assert_eq!(got.erasure.index, fi.erasure.index);
    }

    #[tokio::test]
    async fn test_walk_dir_order_and_limit() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();

        for name in ["b/nested", "a", "c"] {
            let mut fi = sample_fi(0);
            fi.data = Some(b"x".to_vec());
            fi.set_inline_data();
            drive.write_metadata("bucket", name, fi).await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(8);
        drive
            .walk_dir(
                WalkDirOptions {
                    bucket: "bucket".into(),
                    recursive: true,
                    ..Default::default()
                },
                tx,
            )
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = rx.recv().await {
            names.push(entry.name);
        }
        assert_eq!(names, vec!["a", "b/nested", "c"]);

        // Non-recursive walk reports the prefix dir instead.
        let (tx, mut rx) = mpsc::channel(8);
        drive
            .walk_dir(
                WalkDirOptions {
                    bucket: "bucket".into(),
                    recursive: false,
                    ..Default::default()
                },
                tx,
            )
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = rx.recv().await {
            names.push(entry.name);
        }
        assert_eq!(names, vec!["a", "b/", "c"]);
    }

    #[tokio::test]
    async fn test_walk_dir_forward_to() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        for name in ["a", "b", "c"] {
            let mut fi = sample_fi(0);
            fi.data = Some(b"x".to_vec());
            fi.set_inline_data();
            drive.write_metadata("bucket", name, fi).await.unwrap();
        }
        let (tx, mut rx) = mpsc::channel(8);
        drive
            .walk_dir(
                WalkDirOptions {
                    bucket: "bucket".into(),
                    recursive: true,
                    forward_to: Some("b".into()),
                    ..Default::default()
                },
                tx,
            )
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = rx.recv().await {
            names.push(entry.name);
        }
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_offline_drive_rejects_ops() {
        let (_tmp, drive) = new_drive().await;
        drive.make_vol("bucket").await.unwrap();
        drive.set_online(false);
        assert!(matches!(
            drive.read_all("bucket", "x").await,
            Err(Error::DriveOffline)
        ));
        drive.set_online(true);
        assert!(drive.is_online());
    }
}
