//! Quorum arithmetic: error reduction, metadata agreement and shard
//! distribution.
//!
//! Per-drive errors are never surfaced individually; they are counted
//! by kind and the modal outcome is compared against the quorum.

use uuid::Uuid;
use vaultio_common::{Error, Result};
use vaultio_meta::FileInfo;

/// Errors that never count toward a modal outcome: a drive that is
/// simply unavailable says nothing about the object's state.
fn is_ignored(err: &Error) -> bool {
    matches!(
        err,
        Error::DriveOffline
            | Error::DriveNotFound
            | Error::FaultyDrive
            | Error::DriveAccessDenied
            | Error::Timeout
            | Error::PeerUnreachable(_)
    )
}

/// Reduce per-drive outcomes (`None` = success) against a quorum.
///
/// Success wins when at least `quorum` drives succeeded. Otherwise the
/// modal error wins when it reached quorum agreement (e.g. every drive
/// reports `FileNotFound`), else `quorum_err` is returned. Unavailable
/// drives are ignored when counting.
pub fn reduce_quorum_errs(
    errs: &[Option<Error>],
    quorum: usize,
    quorum_err: Error,
) -> Option<Error> {
    let successes = errs.iter().filter(|e| e.is_none()).count();
    if successes >= quorum {
        return None;
    }

    let mut counted: Vec<(usize, &Error)> = Vec::new();
    for err in errs.iter().flatten().filter(|e| !is_ignored(e)) {
        match counted.iter_mut().find(|(_, e)| e.kind_eq(err)) {
            Some((n, _)) => *n += 1,
            None => counted.push((1, err)),
        }
    }
    counted.sort_by(|a, b| b.0.cmp(&a.0));

    match counted.first() {
        Some((n, err)) if *n >= quorum => Some((*err).clone()),
        _ => Some(quorum_err),
    }
}

/// Distribution permutation for an object key: a rotation of
/// `1..=count` seeded by the key's crc32c, so shards spread evenly
/// across the set while every node computes the same layout.
#[must_use]
pub fn hash_order(key: &str, count: usize) -> Vec<u8> {
    let start = (crc32c::crc32c(key.as_bytes()) as usize) % count;
    (0..count)
        .map(|i| (((start + i) % count) + 1) as u8)
        .collect()
}

/// Identity of one metadata copy for agreement grouping: two drives
/// agree when modification time, etag, delete-marker state and data
/// directory all match.
fn group_key(fi: &FileInfo) -> (i64, Option<String>, bool, Option<Uuid>) {
    (fi.mod_time, fi.etag.clone(), fi.deleted, fi.data_dir)
}

/// Pick the modal metadata group across drives.
///
/// Returns the canonical record plus, per drive, whether that drive is
/// part of the agreeing group (and therefore usable for shard reads).
pub fn find_file_info_in_quorum(
    metas: &[Option<FileInfo>],
    quorum: usize,
) -> Result<(FileInfo, Vec<bool>)> {
    let mut groups: Vec<((i64, Option<String>, bool, Option<Uuid>), usize)> = Vec::new();
    for fi in metas.iter().flatten() {
        let key = group_key(fi);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, n)) => *n += 1,
            None => groups.push((key, 1)),
        }
    }

    // Highest cardinality wins; ties break toward the newest write.
    groups.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0 .0.cmp(&a.0 .0)));

    let Some((key, n)) = groups.into_iter().next() else {
        return Err(Error::ReadQuorum {
            have: 0,
            want: quorum,
        });
    };
    if n < quorum {
        return Err(Error::ReadQuorum {
            have: n,
            want: quorum,
        });
    }

    let in_group: Vec<bool> = metas
        .iter()
        .map(|m| m.as_ref().is_some_and(|fi| group_key(fi) == key))
        .collect();
    let canonical = metas
        .iter()
        .zip(&in_group)
        .find_map(|(m, ok)| if *ok { m.clone() } else { None })
        .expect("non-empty quorum group");

    Ok((canonical, in_group))
}

/// Read/write quorum for an object, derived from its stored parity.
#[must_use]
pub fn object_quorums(fi: &FileInfo, drive_count: usize) -> (usize, usize) {
    let data = if fi.erasure.data_blocks > 0 {
        fi.erasure.data_blocks
    } else {
        drive_count / 2
    };
    let parity = if fi.erasure.parity_blocks > 0 {
        fi.erasure.parity_blocks
    } else {
        drive_count - data
    };
    let write = if parity > 1 { data + 1 } else { data };
    (data, write)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_success_quorum() {
        let errs = vec![None, None, None, Some(Error::FileNotFound)];
        assert!(reduce_quorum_errs(&errs, 3, Error::WriteQuorum { have: 0, want: 3 }).is_none());
    }

    #[test]
    fn test_reduce_modal_error() {
        let errs = vec![
            Some(Error::FileNotFound),
            Some(Error::FileNotFound),
            Some(Error::FileNotFound),
            None,
        ];
        let err = reduce_quorum_errs(&errs, 3, Error::ReadQuorum { have: 1, want: 3 }).unwrap();
        assert!(matches!(err, Error::FileNotFound));
    }

    #[test]
    fn test_reduce_ignores_unavailable_drives() {
        // Three offline drives do not outvote reality; the quorum
        // error surfaces instead.
        let errs = vec![
            Some(Error::DriveOffline),
            Some(Error::DriveOffline),
            Some(Error::DriveOffline),
            None,
        ];
        let err = reduce_quorum_errs(&errs, 3, Error::WriteQuorum { have: 1, want: 3 }).unwrap();
        assert!(matches!(err, Error::WriteQuorum { .. }));
    }

    #[test]
    fn test_reduce_falls_back_to_quorum_err() {
        let errs = vec![
            Some(Error::FileNotFound),
            Some(Error::Corrupt),
            Some(Error::DriveOffline),
            None,
        ];
        let err = reduce_quorum_errs(&errs, 3, Error::WriteQuorum { have: 1, want: 3 }).unwrap();
        assert!(matches!(err, Error::WriteQuorum { .. }));
    }

    #[test]
    fn test_hash_order_is_permutation() {
        for key in ["bucket/a", "bucket/b", "x"] {
            let dist = hash_order(key, 8);
            let mut sorted = dist.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (1..=8).collect::<Vec<u8>>());
        }
        // Deterministic across calls.
        assert_eq!(hash_order("bucket/a", 8), hash_order("bucket/a", 8));
    }

    #[test]
    fn test_find_file_info_in_quorum() {
        let mut fi = FileInfo::new("b", "o");
        fi.mod_time = 100;
        fi.etag = Some("e".into());
        let mut stale = fi.clone();
        stale.mod_time = 50;

        let metas = vec![Some(fi.clone()), Some(fi.clone()), Some(stale), None];
        let (canonical, in_group) = find_file_info_in_quorum(&metas, 2).unwrap();
        assert_eq!(canonical.mod_time, 100);
        assert_eq!(in_group, vec![true, true, false, false]);

        let metas = vec![Some(fi.clone()), None, None, None];
        assert!(find_file_info_in_quorum(&metas, 2).is_err());
    }
}
