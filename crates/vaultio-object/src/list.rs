//! Quorum-resolved listing: per-drive walkers merged in
//! byte-lexicographic order.
//!
//! Each selected drive streams entries beneath the prefix; the merger
//! picks the minimum head each round. Heads agreeing on name and
//! metadata digest at quorum resolve directly; disagreeing sets fall
//! back to the modal latest-version group across the drives' metadata.

use crate::api::{ListObjectsInfo, ObjectInfo};
use crate::store::ErasureSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vaultio_common::{Error, Result};
use vaultio_disk::{Drive, MetaCacheEntry, WalkDirOptions};
use vaultio_meta::FileMeta;
use xxhash_rust::xxh64::xxh64;

struct WalkStream {
    rx: mpsc::Receiver<MetaCacheEntry>,
    head: Option<MetaCacheEntry>,
    done: bool,
}

impl WalkStream {
    async fn fill(&mut self) {
        if self.head.is_none() && !self.done {
            match self.rx.recv().await {
                Some(entry) => self.head = Some(entry),
                None => self.done = true,
            }
        }
    }
}

/// Resolve one merged entry from the drives that reported it.
///
/// Fast path: `quorum` identical metadata blobs. Slow path: decode each
/// copy and pick the modal latest-version identity.
fn resolve_entry(copies: &[MetaCacheEntry], quorum: usize) -> Option<MetaCacheEntry> {
    if copies.is_empty() {
        return None;
    }
    // Prefix directories carry no metadata; presence is agreement.
    if copies[0].is_dir() {
        if copies.len() >= quorum {
            return Some(copies[0].clone());
        }
        return None;
    }

    let mut digests: Vec<(u64, usize, usize)> = Vec::new(); // (digest, count, first idx)
    for (i, copy) in copies.iter().enumerate() {
        let d = xxh64(&copy.metadata, 0);
        match digests.iter_mut().find(|(dig, _, _)| *dig == d) {
            Some((_, n, _)) => *n += 1,
            None => digests.push((d, 1, i)),
        }
    }
    digests.sort_by(|a, b| b.1.cmp(&a.1));
    if let Some(&(_, n, idx)) = digests.first() {
        if n >= quorum {
            return Some(copies[idx].clone());
        }
    }

    // Partial agreement: group by the latest version's identity.
    let mut groups: Vec<((i64, uuid::Uuid), usize, usize)> = Vec::new();
    for (i, copy) in copies.iter().enumerate() {
        let Ok(meta) = FileMeta::load(&copy.metadata) else {
            continue;
        };
        let Some(head) = meta.versions.first() else {
            continue;
        };
        let key = (head.header.mod_time, head.header.version_id);
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, n, _)) => *n += 1,
            None => groups.push((key, 1, i)),
        }
    }
    groups.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0 .0.cmp(&a.0 .0)));
    match groups.first() {
        Some(&(_, n, idx)) if n >= quorum => Some(copies[idx].clone()),
        _ => {
            debug!(
                name = copies[0].name,
                copies = copies.len(),
                quorum,
                "listing entry below quorum, skipped"
            );
            None
        }
    }
}

impl ErasureSet {
    pub(crate) async fn list_objects_inner(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        delimiter: Option<&str>,
        max_keys: usize,
        versions: bool,
    ) -> Result<ListObjectsInfo> {
        self.get_bucket_info_inner(bucket).await?;
        if prefix.split('/').any(|seg| seg == ".." || seg == ".") {
            return Err(Error::InvalidObjectKey(
                vaultio_common::ObjectKeyError::InvalidSegment,
            ));
        }

        let recursive = delimiter != Some("/");
        let max_keys = if max_keys == 0 { 1000 } else { max_keys.min(10_000) };

        // Consult a subset of drives per the read policy, falling back
        // to every online drive when the preferred pool is short.
        let ask = self.config().ask_disks();
        let online: Vec<Arc<dyn Drive>> = self
            .drives()
            .iter()
            .filter(|d| d.is_online())
            .cloned()
            .collect();
        if online.len() < self.config().read_quorum() {
            return Err(Error::ReadQuorum {
                have: online.len(),
                want: self.config().read_quorum(),
            });
        }
        let selected: Vec<Arc<dyn Drive>> = online.iter().take(ask).cloned().collect();
        let list_quorum = selected.len() / 2 + 1;

        // Split the prefix into the directory to walk and the entry
        // filter within it.
        let base_dir = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };

        let mut streams = Vec::with_capacity(selected.len());
        for drive in &selected {
            let (tx, rx) = mpsc::channel(64);
            let opts = WalkDirOptions {
                bucket: bucket.to_string(),
                base_dir: base_dir.to_string(),
                recursive,
                filter_prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
                forward_to: marker.map(str::to_string),
                limit: 0,
            };
            let drive = Arc::clone(drive);
            tokio::spawn(async move {
                if let Err(e) = drive.walk_dir(opts, tx).await {
                    if !e.is_not_found() {
                        warn!(drive = %drive.endpoint(), error = %e, "listing walk failed");
                    }
                }
            });
            streams.push(WalkStream {
                rx,
                head: None,
                done: false,
            });
        }

        let mut out = ListObjectsInfo::default();
        let mut emitted = 0usize;

        'merge: loop {
            for stream in &mut streams {
                stream.fill().await;
            }

            let min = streams
                .iter()
                .filter_map(|s| s.head.as_ref().map(|e| e.name.clone()))
                .min();
            let Some(min) = min else {
                break;
            };

            let mut copies = Vec::new();
            for stream in &mut streams {
                if stream.head.as_ref().is_some_and(|e| e.name == min) {
                    copies.push(stream.head.take().expect("head checked above"));
                }
            }

            let Some(resolved) = resolve_entry(&copies, list_quorum) else {
                continue;
            };

            // Exact prefix and marker enforcement; walkers only
            // approximate them.
            if !resolved.name.starts_with(prefix) {
                continue;
            }
            if marker.is_some_and(|m| resolved.name.as_str() <= m) {
                continue;
            }

            if resolved.is_dir() {
                out.prefixes.push(resolved.name.clone());
                emitted += 1;
            } else {
                let Ok(meta) = FileMeta::load(&resolved.metadata) else {
                    continue;
                };
                if versions {
                    let Ok(infos) = meta.list_versions(bucket, &resolved.name) else {
                        continue;
                    };
                    for fi in infos {
                        out.objects.push(ObjectInfo::from_file_info(&fi, bucket));
                        emitted += 1;
                        if emitted >= max_keys {
                            out.is_truncated = true;
                            out.next_marker = Some(resolved.name.clone());
                            break 'merge;
                        }
                    }
                } else {
                    match meta.into_fileinfo(bucket, &resolved.name, None, false, false) {
                        // Flat listings hide objects whose latest
                        // version is a delete marker.
                        Ok(fi) if !fi.deleted => {
                            out.objects.push(ObjectInfo::from_file_info(&fi, bucket));
                            emitted += 1;
                        }
                        _ => continue,
                    }
                }
            }

            if emitted >= max_keys {
                // More pending anywhere means the listing truncated.
                for stream in &mut streams {
                    stream.fill().await;
                }
                if streams.iter().any(|s| s.head.is_some()) {
                    out.is_truncated = true;
                    out.next_marker = Some(min);
                }
                break;
            }
        }

        Ok(out)
    }
}
