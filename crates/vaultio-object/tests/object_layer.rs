//! End-to-end object layer scenarios over local drives.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::sync::Arc;
use vaultio_common::{Error, HealScanMode, LockConfig, SetConfig};
use vaultio_disk::{Drive, LocalDrive, ReadOptions};
use vaultio_lock::{LocalLocker, Locker};
use vaultio_object::{
    CompletePart, DriveState, ErasureSet, HealOpts, ObjectLayer, ObjectOptions, PutObjReader,
};

struct Harness {
    _dirs: Vec<tempfile::TempDir>,
    locals: Vec<Arc<LocalDrive>>,
    set: ErasureSet,
}

async fn new_set(data: usize, parity: usize, scan: HealScanMode) -> Harness {
    let mut dirs = Vec::new();
    let mut locals = Vec::new();
    let mut drives: Vec<Arc<dyn Drive>> = Vec::new();
    for _ in 0..data + parity {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(LocalDrive::open(dir.path()).await.unwrap());
        locals.push(Arc::clone(&drive));
        drives.push(drive);
        dirs.push(dir);
    }

    let mut config = SetConfig::new(data, parity).unwrap();
    config.heal_scan_mode = scan;

    let lockers: Vec<Arc<dyn Locker>> = vec![Arc::new(LocalLocker::new())];
    let set = ErasureSet::new(drives, lockers, config, LockConfig::default(), "test-node")
        .await
        .unwrap();

    Harness {
        _dirs: dirs,
        locals,
        set,
    }
}

async fn get_bytes(set: &ErasureSet, bucket: &str, object: &str) -> vaultio_common::Result<Vec<u8>> {
    let mut out = Vec::new();
    set.get_object(bucket, object, None, &mut out, &ObjectOptions::default())
        .await?;
    Ok(out)
}

async fn data_dir_of(h: &Harness, bucket: &str, object: &str) -> uuid::Uuid {
    for local in &h.locals {
        if let Ok(fi) = local
            .read_version(bucket, object, None, ReadOptions::default())
            .await
        {
            if let Some(dd) = fi.data_dir {
                return dd;
            }
        }
    }
    panic!("no drive carries a data dir for {bucket}/{object}");
}

/// S1: a PUT followed by a GET returns the exact bytes and an ETag
/// equal to the content MD5.
#[tokio::test]
async fn test_put_get_roundtrip() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let payload = vec![0xA5u8; 1 << 20];
    let info = h
        .set
        .put_object(
            "bucket",
            "o1",
            PutObjReader::from_bytes(Bytes::from(payload.clone())),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(info.size, 1 << 20);
    let want_etag = hex::encode(Md5::digest(&payload));
    assert_eq!(info.etag.as_deref(), Some(want_etag.as_str()));

    let got = get_bytes(&h.set, "bucket", "o1").await.unwrap();
    assert_eq!(got, payload);

    let stat = h
        .set
        .get_object_info("bucket", "o1", &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(stat.size, 1 << 20);
    assert_eq!(stat.etag.as_deref(), Some(want_etag.as_str()));
}

#[tokio::test]
async fn test_ranged_get() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let payload: Vec<u8> = (0..(1 << 20) + 4096u32).map(|i| (i % 251) as u8).collect();
    h.set
        .put_object(
            "bucket",
            "ranged",
            PutObjReader::from_bytes(Bytes::from(payload.clone())),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    // A window crossing the erasure block boundary.
    let mut out = Vec::new();
    h.set
        .get_object(
            "bucket",
            "ranged",
            Some(((1 << 20) - 100, 300)),
            &mut out,
            &ObjectOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, &payload[(1 << 20) - 100..(1 << 20) + 200]);
}

/// Small objects are stored inline in xl.meta: the object directory
/// holds no data dir at all.
#[tokio::test]
async fn test_small_object_inline() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let payload = vec![0x42u8; 1024];
    h.set
        .put_object(
            "bucket",
            "tiny",
            PutObjReader::from_bytes(Bytes::from(payload.clone())),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    for local in &h.locals {
        let entries: Vec<_> = std::fs::read_dir(local.root().join("bucket/tiny"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["xl.meta"]);
    }

    assert_eq!(get_bytes(&h.set, "bucket", "tiny").await.unwrap(), payload);
}

/// S2: the object survives losing up to N shard files, and heal
/// restores the lost shards; a second heal finds nothing to do.
#[tokio::test]
async fn test_survive_parity_losses_and_heal() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let payload = vec![0xA5u8; 1 << 20];
    h.set
        .put_object(
            "bucket",
            "o1",
            PutObjReader::from_bytes(Bytes::from(payload.clone())),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    let dd = data_dir_of(&h, "bucket", "o1").await;
    for local in h.locals.iter().take(2) {
        std::fs::remove_file(
            local
                .root()
                .join("bucket/o1")
                .join(dd.to_string())
                .join("part.1"),
        )
        .unwrap();
    }

    // Reads still decode from the surviving shards.
    assert_eq!(get_bytes(&h.set, "bucket", "o1").await.unwrap(), payload);

    let result = h
        .set
        .heal_object("bucket", "o1", None, &HealOpts::default())
        .await
        .unwrap();
    assert_eq!(result.disks_to_heal, 2);
    assert!(result.after.iter().all(|s| s.state == DriveState::Ok));

    // The shard files are physically back.
    for local in h.locals.iter().take(2) {
        assert!(local
            .root()
            .join("bucket/o1")
            .join(dd.to_string())
            .join("part.1")
            .exists());
    }
    assert_eq!(get_bytes(&h.set, "bucket", "o1").await.unwrap(), payload);

    // Idempotency: an immediate second heal has nothing to repair.
    let again = h
        .set
        .heal_object("bucket", "o1", None, &HealOpts::default())
        .await
        .unwrap();
    assert_eq!(again.disks_to_heal, 0);
}

/// S3: a flipped bit in one shard is caught by the bitrot verifier;
/// reads stay correct and a deep heal repairs the drive.
#[tokio::test]
async fn test_bitrot_detection_and_heal() {
    let h = new_set(2, 2, HealScanMode::Deep).await;
    h.set.make_bucket("bucket").await.unwrap();

    let payload = vec![0xA5u8; 1 << 20];
    h.set
        .put_object(
            "bucket",
            "o3",
            PutObjReader::from_bytes(Bytes::from(payload.clone())),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    let dd = data_dir_of(&h, "bucket", "o3").await;
    let tainted_path = h.locals[0]
        .root()
        .join("bucket/o3")
        .join(dd.to_string())
        .join("part.1");
    let mut shard = std::fs::read(&tainted_path).unwrap();
    let mid = shard.len() / 2;
    shard[mid] ^= 0x01;
    std::fs::write(&tainted_path, &shard).unwrap();

    // The verifier rejects the tainted shard; decode uses the rest.
    assert_eq!(get_bytes(&h.set, "bucket", "o3").await.unwrap(), payload);

    let result = h
        .set
        .heal_object("bucket", "o3", None, &HealOpts::default())
        .await
        .unwrap();
    assert_eq!(result.disks_to_heal, 1);
    assert_eq!(result.before[0].state, DriveState::Corrupt);
    assert_eq!(result.after[0].state, DriveState::Ok);

    // The healed shard verifies again.
    let again = h
        .set
        .heal_object("bucket", "o3", None, &HealOpts::default())
        .await
        .unwrap();
    assert_eq!(again.disks_to_heal, 0);
    assert_eq!(get_bytes(&h.set, "bucket", "o3").await.unwrap(), payload);
}

/// S4: with three of four drives offline a PUT fails the write quorum
/// and leaves no partial object behind on the surviving drive.
#[tokio::test]
async fn test_write_quorum_loss_rolls_back() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    for local in h.locals.iter().take(3) {
        local.set_online(false);
    }

    let err = h
        .set
        .put_object(
            "bucket",
            "o2",
            PutObjReader::from_bytes(Bytes::from(vec![1u8; 1 << 20])),
            &ObjectOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WriteQuorum { .. }), "got {err:?}");

    assert!(!h.locals[3].root().join("bucket/o2").exists());
}

/// A heal replays inline versions onto a drive that lost the whole
/// object directory.
#[tokio::test]
async fn test_heal_inline_object() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let payload = vec![0x17u8; 2048];
    h.set
        .put_object(
            "bucket",
            "tiny",
            PutObjReader::from_bytes(Bytes::from(payload.clone())),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    std::fs::remove_dir_all(h.locals[2].root().join("bucket/tiny")).unwrap();

    let result = h
        .set
        .heal_object("bucket", "tiny", None, &HealOpts::default())
        .await
        .unwrap();
    assert_eq!(result.disks_to_heal, 1);
    assert_eq!(result.after[2].state, DriveState::Ok);

    let fi = h.locals[2]
        .read_version(
            "bucket",
            "tiny",
            None,
            ReadOptions {
                read_data: true,
                incl_free_versions: false,
            },
        )
        .await
        .unwrap();
    assert!(fi.data.is_some());
    assert_eq!(get_bytes(&h.set, "bucket", "tiny").await.unwrap(), payload);
}

/// S6: deleting under versioning writes a delete marker; the versions
/// listing shows the marker as latest above the object version.
#[tokio::test]
async fn test_delete_marker_under_versioning() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let versioned = ObjectOptions {
        versioned: true,
        ..Default::default()
    };
    let payload = vec![0x5Au8; 4096];
    let v1 = h
        .set
        .put_object(
            "bucket",
            "v",
            PutObjReader::from_bytes(Bytes::from(payload.clone())),
            &versioned,
        )
        .await
        .unwrap();
    let v1_id = v1.version_id.unwrap();

    let deleted = h
        .set
        .delete_object("bucket", "v", &versioned)
        .await
        .unwrap();
    assert!(deleted.delete_marker);
    let v2_id = deleted.version_id.unwrap();
    assert_ne!(v1_id, v2_id);

    // A flat GET now misses; the specific version still reads.
    assert!(matches!(
        get_bytes(&h.set, "bucket", "v").await,
        Err(Error::ObjectNotFound { .. })
    ));
    let mut out = Vec::new();
    h.set
        .get_object(
            "bucket",
            "v",
            None,
            &mut out,
            &ObjectOptions {
                version_id: Some(v1_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(out, payload);

    let listing = h
        .set
        .list_object_versions("bucket", "", None, 100)
        .await
        .unwrap();
    assert_eq!(listing.objects.len(), 2);
    assert_eq!(listing.objects[0].version_id, Some(v2_id));
    assert!(listing.objects[0].delete_marker);
    assert!(listing.objects[0].is_latest);
    assert_eq!(listing.objects[1].version_id, Some(v1_id));
    assert!(!listing.objects[1].is_latest);
}

#[tokio::test]
async fn test_unversioned_delete_removes_object() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    h.set
        .put_object(
            "bucket",
            "gone",
            PutObjReader::from_bytes(Bytes::from(vec![1u8; 512])),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    let res = h
        .set
        .delete_object("bucket", "gone", &ObjectOptions::default())
        .await
        .unwrap();
    assert!(!res.delete_marker);
    assert!(res.is_empty);

    assert!(matches!(
        get_bytes(&h.set, "bucket", "gone").await,
        Err(Error::ObjectNotFound { .. })
    ));
}

/// Property 7: a frozen namespace lists every object exactly once, in
/// byte order; a delimiter listing folds prefixes.
#[tokio::test]
async fn test_listing_complete_and_ordered() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    for name in ["b", "a/2", "c/d/e", "a/1"] {
        h.set
            .put_object(
                "bucket",
                name,
                PutObjReader::from_bytes(Bytes::from(vec![9u8; 256])),
                &ObjectOptions::default(),
            )
            .await
            .unwrap();
    }

    let flat = h
        .set
        .list_objects("bucket", "", None, None, 1000)
        .await
        .unwrap();
    let names: Vec<&str> = flat.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a/1", "a/2", "b", "c/d/e"]);
    assert!(!flat.is_truncated);

    let rooted = h
        .set
        .list_objects("bucket", "", None, Some("/"), 1000)
        .await
        .unwrap();
    let names: Vec<&str> = rooted.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["b"]);
    assert_eq!(rooted.prefixes, vec!["a/", "c/"]);

    let prefixed = h
        .set
        .list_objects("bucket", "a/", None, None, 1000)
        .await
        .unwrap();
    let names: Vec<&str> = prefixed.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a/1", "a/2"]);

    // Pagination: marker resumes after the named key.
    let page = h
        .set
        .list_objects("bucket", "", Some("a/2"), None, 1000)
        .await
        .unwrap();
    let names: Vec<&str> = page.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["b", "c/d/e"]);
}

#[tokio::test]
async fn test_multipart_upload_roundtrip() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let upload = h
        .set
        .new_multipart_upload("bucket", "big", &ObjectOptions::default())
        .await
        .unwrap();

    let part1_data = vec![0xABu8; 6 * 1024 * 1024];
    let part2_data = vec![0xCDu8; 1024];

    let p1 = h
        .set
        .put_object_part(
            "bucket",
            "big",
            &upload.upload_id,
            1,
            PutObjReader::from_bytes(Bytes::from(part1_data.clone())),
        )
        .await
        .unwrap();
    let p2 = h
        .set
        .put_object_part(
            "bucket",
            "big",
            &upload.upload_id,
            2,
            PutObjReader::from_bytes(Bytes::from(part2_data.clone())),
        )
        .await
        .unwrap();

    let listed = h
        .set
        .list_object_parts("bucket", "big", &upload.upload_id, 0, 100)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].number, 1);
    assert_eq!(listed[0].size, part1_data.len() as i64);

    let info = h
        .set
        .complete_multipart_upload(
            "bucket",
            "big",
            &upload.upload_id,
            vec![
                CompletePart {
                    part_number: 1,
                    etag: p1.etag.clone(),
                },
                CompletePart {
                    part_number: 2,
                    etag: p2.etag.clone(),
                },
            ],
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(info.size as usize, part1_data.len() + part2_data.len());
    assert!(info.etag.unwrap().ends_with("-2"));

    let mut want = part1_data;
    want.extend_from_slice(&part2_data);
    assert_eq!(get_bytes(&h.set, "bucket", "big").await.unwrap(), want);

    // The upload is gone once completed.
    assert!(matches!(
        h.set
            .list_object_parts("bucket", "big", &upload.upload_id, 0, 100)
            .await,
        Err(Error::UploadNotFound(_))
    ));
}

#[tokio::test]
async fn test_multipart_abort() {
    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let upload = h
        .set
        .new_multipart_upload("bucket", "late", &ObjectOptions::default())
        .await
        .unwrap();
    h.set
        .abort_multipart_upload("bucket", "late", &upload.upload_id)
        .await
        .unwrap();
    assert!(matches!(
        h.set
            .abort_multipart_upload("bucket", "late", &upload.upload_id)
            .await,
        Err(Error::UploadNotFound(_))
    ));
}

#[tokio::test]
async fn test_bucket_lifecycle() {
    let h = new_set(2, 2, HealScanMode::Normal).await;

    h.set.make_bucket("alpha").await.unwrap();
    h.set.make_bucket("beta").await.unwrap();
    assert!(matches!(
        h.set.make_bucket("alpha").await,
        Err(Error::BucketExists(_))
    ));
    assert!(matches!(
        h.set.make_bucket("Bad_Name").await,
        Err(Error::InvalidBucketName(_))
    ));

    let buckets = h.set.list_buckets().await.unwrap();
    let names: Vec<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    h.set
        .put_object(
            "beta",
            "x",
            PutObjReader::from_bytes(Bytes::from(vec![1u8; 64])),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();
    assert!(matches!(
        h.set.delete_bucket("beta").await,
        Err(Error::BucketNotEmpty(_))
    ));

    h.set.delete_bucket("alpha").await.unwrap();
    assert!(matches!(
        h.set.get_bucket_info("alpha").await,
        Err(Error::BucketNotFound(_))
    ));
}

#[tokio::test]
async fn test_listing_cache_roundtrip() {
    use vaultio_disk::MetaCacheEntry;

    let h = new_set(2, 2, HealScanMode::Normal).await;
    h.set.make_bucket("bucket").await.unwrap();

    let entries: Vec<MetaCacheEntry> = (0..1200)
        .map(|i| MetaCacheEntry {
            name: format!("obj-{i:05}"),
            metadata: Bytes::from(vec![(i % 251) as u8; 64]),
        })
        .collect();

    let listing_id = uuid::Uuid::new_v4();
    h.set
        .save_listing("bucket", listing_id, &entries)
        .await
        .unwrap();

    let loaded = h.set.load_listing("bucket", listing_id).await.unwrap();
    assert_eq!(loaded.len(), entries.len());
    assert_eq!(loaded[7].name, entries[7].name);
    assert_eq!(loaded[1100].metadata, entries[1100].metadata);

    h.set.delete_listing("bucket", listing_id).await.unwrap();
    assert!(h.set.load_listing("bucket", listing_id).await.is_err());
}
