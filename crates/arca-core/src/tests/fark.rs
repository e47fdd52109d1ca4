use arca_storage::{LocalBackend, StorageBackend};
use arca_types::error::ArcaError;
use arca_types::{BlobKey, CompressionType, PackId, Sha1Digest, StorageType};

use crate::repo::fark::Fark;
use crate::repo::pack::PackBuilder;
use crate::tests::helpers::{fark, fast_retry, object, TEST_PACK_SET};
use crate::testutil::{MemoryBackend, TEST_BUCKET, TEST_COMPUTER};

fn key(data: &[u8]) -> BlobKey {
    BlobKey::new(
        Sha1Digest::compute(data),
        StorageType::Standard,
        true,
        CompressionType::Lz4,
    )
}

#[test]
fn paths_follow_target_layout() {
    let fark = fark(MemoryBackend::new());
    let pack_id = PackId::new(TEST_PACK_SET, Sha1Digest([0xab; 20]));
    let hex = "ab".repeat(20);

    assert_eq!(
        fark.pack_key(&pack_id),
        format!("computer-1/packsets/bucket-1-blobs/{hex}.pack")
    );
    assert_eq!(
        fark.index_key(&pack_id),
        format!("computer-1/packsets/bucket-1-blobs/{hex}.index")
    );
    assert_eq!(
        fark.object_key(TEST_PACK_SET, &Sha1Digest([0xab; 20])),
        format!("computer-1/packsets/bucket-1-blobs/objects/{hex}")
    );
    assert_eq!(
        fark.head_key(TEST_BUCKET),
        "computer-1/bucketdata/bucket-1/refs/heads/master"
    );
    assert_eq!(
        fark.encryption_params_key(TEST_BUCKET),
        "computer-1/bucketdata/bucket-1/encryption.dat"
    );
}

#[test]
fn head_is_absent_until_set() {
    let fark = fark(MemoryBackend::new());
    assert_eq!(fark.head_blob_key(TEST_BUCKET).unwrap(), None);

    let head = key(b"commit 1");
    fark.set_head_blob_key(TEST_BUCKET, None, &head, false).unwrap();
    assert_eq!(fark.head_blob_key(TEST_BUCKET).unwrap(), Some(head));

    fark.delete_head_blob_key(TEST_BUCKET).unwrap();
    assert_eq!(fark.head_blob_key(TEST_BUCKET).unwrap(), None);
}

#[test]
fn every_head_update_appends_a_reflog_entry() {
    let fark = fark(MemoryBackend::new());
    let first = key(b"commit 1");
    let second = key(b"commit 2");
    fark.set_head_blob_key(TEST_BUCKET, None, &first, false).unwrap();
    fark.set_head_blob_key(TEST_BUCKET, Some(&first), &second, true)
        .unwrap();

    let ids = fark.reflog_entry_ids(TEST_BUCKET).unwrap();
    assert_eq!(ids.len(), 2);
    let oldest = fark.reflog_entry(TEST_BUCKET, &ids[0]).unwrap();
    let newest = fark.reflog_entry(TEST_BUCKET, &ids[1]).unwrap();
    if oldest.new_head_blob_key == second {
        // Same millisecond: ids tie on the timestamp and sort by suffix.
        assert_eq!(newest.new_head_blob_key, first);
    } else {
        assert_eq!(oldest.old_head_blob_key, None);
        assert_eq!(oldest.new_head_blob_key, first);
        assert!(!oldest.rewrite);
        assert_eq!(newest.old_head_blob_key, Some(first));
        assert_eq!(newest.new_head_blob_key, second);
        assert!(newest.rewrite);
    }
}

#[test]
fn reflog_of_unknown_entry_is_not_found() {
    let fark = fark(MemoryBackend::new());
    assert!(fark.reflog_entry_ids(TEST_BUCKET).unwrap().is_empty());
    assert!(matches!(
        fark.reflog_entry(TEST_BUCKET, "0000000000000000-00000000"),
        Err(ArcaError::NotFound(_))
    ));
}

#[test]
fn encryption_params_are_written_once() {
    let fark = fark(MemoryBackend::new());
    assert_eq!(fark.encryption_params(TEST_BUCKET).unwrap(), None);
    assert!(fark
        .put_encryption_params_if_absent(TEST_BUCKET, b"first")
        .unwrap());
    assert!(!fark
        .put_encryption_params_if_absent(TEST_BUCKET, b"second")
        .unwrap());
    assert_eq!(
        fark.encryption_params(TEST_BUCKET).unwrap().as_deref(),
        Some(&b"first"[..])
    );
}

#[test]
fn loose_objects_roundtrip() {
    let fark = fark(MemoryBackend::new());
    let (sha1, data) = object(4, 32);
    assert!(!fark.contains_object_for_sha1(TEST_PACK_SET, &sha1).unwrap());

    fark.put_data_for_sha1(TEST_PACK_SET, &sha1, &data).unwrap();
    assert!(fark.contains_object_for_sha1(TEST_PACK_SET, &sha1).unwrap());
    assert_eq!(fark.data_for_sha1(TEST_PACK_SET, &sha1).unwrap(), data);
    assert_eq!(fark.size_of_object(TEST_PACK_SET, &sha1).unwrap(), Some(32));
    assert_eq!(fark.loose_object_sha1s(TEST_PACK_SET).unwrap(), vec![sha1]);

    // Other pack sets, and so other buckets, never see it.
    assert!(!fark.contains_object_for_sha1("bucket-2-blobs", &sha1).unwrap());
    assert!(fark.loose_object_sha1s("bucket-2-blobs").unwrap().is_empty());
    // Nor is it mistaken for a pack.
    assert!(fark.pack_ids(TEST_PACK_SET).unwrap().is_empty());

    fark.delete_object_for_sha1(TEST_PACK_SET, &sha1).unwrap();
    assert!(matches!(
        fark.data_for_sha1(TEST_PACK_SET, &sha1),
        Err(ArcaError::NotFound(_))
    ));
}

#[test]
fn pack_ids_come_from_index_objects() {
    let backend = MemoryBackend::new();
    let fark = fark(backend.clone());
    let mut builder = PackBuilder::new(TEST_PACK_SET);
    let (sha1, data) = object(1, 10);
    builder.add_data(sha1, data);
    let sealed = builder.seal().unwrap();

    // A pack without its index is not part of the set yet.
    fark.put_pack(&sealed.pack_id, &sealed.pack_bytes).unwrap();
    assert!(fark.pack_ids(TEST_PACK_SET).unwrap().is_empty());

    fark.put_pack_index(&sealed.pack_id, &sealed.index_bytes)
        .unwrap();
    assert_eq!(
        fark.pack_ids(TEST_PACK_SET).unwrap(),
        vec![sealed.pack_id.clone()]
    );
    assert!(fark.pack_ids("other-set").unwrap().is_empty());
    assert_eq!(
        fark.size_of_pack(&sealed.pack_id).unwrap(),
        Some(sealed.pack_bytes.len() as u64)
    );
}

#[test]
fn cache_serves_pack_reads_until_cleared() {
    let remote = MemoryBackend::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = LocalBackend::new(cache_dir.path().to_str().unwrap()).unwrap();
    let fark = Fark::new(
        std::sync::Arc::new(remote.clone()),
        TEST_COMPUTER,
        fast_retry(),
    )
    .with_cache(cache);

    let mut builder = PackBuilder::new(TEST_PACK_SET);
    let (sha1, data) = object(6, 40);
    builder.add_data(sha1, data.clone());
    let sealed = builder.seal().unwrap();
    fark.put_pack(&sealed.pack_id, &sealed.pack_bytes).unwrap();
    assert!(fark.contains_pack_in_cache(&sealed.pack_id));

    // Remove the remote copy: reads still succeed from the cache.
    remote.delete(&fark.pack_key(&sealed.pack_id)).unwrap();
    let entry = &sealed.entries[0];
    let bytes = fark
        .pack_range(&sealed.pack_id, entry.offset(), entry.data_length(), true)
        .unwrap();
    assert_eq!(bytes, data);

    fark.clear_cache().unwrap();
    assert!(!fark.contains_pack_in_cache(&sealed.pack_id));
    assert!(matches!(
        fark.pack_range(&sealed.pack_id, entry.offset(), entry.data_length(), true),
        Err(ArcaError::NotFound(_))
    ));
}

#[test]
fn clearing_one_pack_set_keeps_the_others() {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = LocalBackend::new(cache_dir.path().to_str().unwrap()).unwrap();
    let fark = Fark::new(
        std::sync::Arc::new(MemoryBackend::new()),
        TEST_COMPUTER,
        fast_retry(),
    )
    .with_cache(cache);

    let seal = |set: &str| {
        let mut builder = PackBuilder::new(set);
        let (sha1, data) = object(1, 10);
        builder.add_data(sha1, data);
        builder.seal().unwrap()
    };
    let blobs = seal("bucket-1-blobs");
    let trees = seal("bucket-1-trees");
    fark.put_pack(&blobs.pack_id, &blobs.pack_bytes).unwrap();
    fark.put_pack(&trees.pack_id, &trees.pack_bytes).unwrap();

    fark.clear_pack_set_cache("bucket-1-blobs").unwrap();
    assert!(!fark.contains_pack_in_cache(&blobs.pack_id));
    assert!(fark.contains_pack_in_cache(&trees.pack_id));
}
