use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use strata_core::blob::memory::MemoryStorage;
use strata_core::blob::{list_all, BlobStorage};
use strata_core::cancel::CancelToken;
use strata_core::clock::{Clock, FakeClock};
use strata_core::compress::Compression;
use strata_core::crypto::keyderiv::KeyDerivationAlgorithm;
use strata_core::format::FormatOptions;
use strata_core::maintenance::gc::{SnapshotRecord, SNAPSHOT_MANIFEST_TYPE};
use strata_core::maintenance::{MaintenanceMode, RunParameters};
use strata_core::repo::{Repository, RepositoryOptions};
use strata_core::StrataError;

const PASSWORD: &str = "pw";

fn fake_clock() -> Arc<FakeClock> {
    Arc::new(FakeClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    ))
}

fn format_options() -> FormatOptions {
    FormatOptions {
        key_derivation_algorithm: KeyDerivationAlgorithm::TestingOnlyInsecure,
        ..Default::default()
    }
}

fn repo_options(clock: &Arc<FakeClock>) -> RepositoryOptions {
    RepositoryOptions {
        clock: clock.clone(),
        username: "it".into(),
        hostname: "host".into(),
        ..Default::default()
    }
}

fn new_repo() -> (Arc<MemoryStorage>, Arc<FakeClock>, Repository) {
    let clock = fake_clock();
    let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
    let repo = Repository::create(
        storage.clone(),
        PASSWORD,
        &format_options(),
        repo_options(&clock),
    )
    .unwrap();
    (storage, clock, repo)
}

fn reopen(storage: &Arc<MemoryStorage>, clock: &Arc<FakeClock>) -> Repository {
    Repository::open(
        storage.clone() as Arc<dyn BlobStorage>,
        PASSWORD,
        repo_options(clock),
    )
    .unwrap()
}

#[test]
fn empty_repo_roundtrip_writes_one_pack_and_one_index() {
    let (storage, _clock, repo) = new_repo();
    let id = repo
        .contents()
        .write(b"hello", None, Compression::None)
        .unwrap();
    assert_eq!(repo.contents().read(&id).unwrap(), b"hello");
    repo.flush().unwrap();

    assert_eq!(list_all(&*storage, "p").unwrap().len(), 1);
    assert_eq!(list_all(&*storage, "n").unwrap().len(), 1);
    assert_eq!(list_all(&*storage, "q").unwrap().len(), 0);
    assert_eq!(repo.contents().read(&id).unwrap(), b"hello");
}

#[test]
fn dedup_across_sessions_adds_no_pack_bytes() {
    let (storage, clock, session_a) = new_repo();
    let megabyte = vec![0u8; 1024 * 1024];

    let id_a = session_a
        .contents()
        .write(&megabyte, None, Compression::None)
        .unwrap();
    session_a.close().unwrap();
    let bytes_after_a = storage.total_bytes_with_prefix("p");

    let session_b = reopen(&storage, &clock);
    let id_b = session_b
        .contents()
        .write(&megabyte, None, Compression::None)
        .unwrap();
    session_b.close().unwrap();

    assert_eq!(id_a, id_b);
    // The second write was a dedupe hit: zero new pack bytes.
    assert_eq!(storage.total_bytes_with_prefix("p"), bytes_after_a);
    assert!(bytes_after_a <= 1024 * 1024 + 4096);
}

#[test]
fn tombstone_precedence_under_concurrent_sessions() {
    let (storage, clock, setup) = new_repo();
    let id = setup
        .contents()
        .write(b"contested", None, Compression::None)
        .unwrap();
    setup.close().unwrap();

    // One session deletes at t1; another, observing the tombstone, writes
    // the same plaintext at a later t2.
    let deleter = reopen(&storage, &clock);
    clock.advance(Duration::seconds(10));
    deleter.contents().delete(&id).unwrap();
    deleter.close().unwrap();

    let writer = reopen(&storage, &clock);
    clock.advance(Duration::seconds(10));
    let rewritten = writer
        .contents()
        .write(b"contested", None, Compression::None)
        .unwrap();
    assert_eq!(rewritten, id);
    writer.close().unwrap();

    // After both flush, the newer write outranks the older tombstone.
    let observer = reopen(&storage, &clock);
    assert_eq!(observer.contents().read(&id).unwrap(), b"contested");

    // The mirror-image race: a deletion strictly after the write wins.
    let second = observer
        .contents()
        .write(b"contested two", None, Compression::None)
        .unwrap();
    observer.close().unwrap();

    let deleter = reopen(&storage, &clock);
    clock.advance(Duration::seconds(10));
    deleter.contents().delete(&second).unwrap();
    deleter.close().unwrap();

    let observer = reopen(&storage, &clock);
    assert!(matches!(
        observer.contents().read(&second),
        Err(StrataError::ContentNotFound(_))
    ));
}

#[test]
fn pack_blobs_stay_bounded() {
    let clock = fake_clock();
    let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
    let mut opts = format_options();
    opts.max_pack_size = 64 * 1024;
    let repo =
        Repository::create(storage.clone(), PASSWORD, &opts, repo_options(&clock)).unwrap();

    // Uncompressible pseudo-random contents, many times the pack size.
    let mut seed = 0x2545_f491_4f6c_dd1du64;
    for _ in 0..64 {
        let chunk: Vec<u8> = (0..8 * 1024)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed as u8
            })
            .collect();
        repo.contents()
            .write(&chunk, None, Compression::None)
            .unwrap();
    }
    repo.close().unwrap();

    let max_single_content = 8 * 1024 + 64;
    for meta in list_all(&*storage, "p").unwrap() {
        assert!(
            meta.length <= 64 * 1024 + max_single_content,
            "pack {} exceeds bound: {}",
            meta.id,
            meta.length
        );
    }
}

#[test]
fn full_lifecycle_on_filesystem_backend() {
    let dir = tempfile::tempdir().unwrap();
    let clock = fake_clock();
    let storage = Arc::new(
        strata_core::blob::filesystem::FilesystemStorage::new(dir.path().join("repo")).unwrap(),
    );

    let repo = Repository::create(
        storage.clone() as Arc<dyn BlobStorage>,
        PASSWORD,
        &format_options(),
        repo_options(&clock),
    )
    .unwrap();

    let id = repo
        .contents()
        .write(b"on disk", None, Compression::Zstd { level: 3 })
        .unwrap();
    let mut labels = BTreeMap::new();
    labels.insert("type".to_string(), SNAPSHOT_MANIFEST_TYPE.to_string());
    let record = SnapshotRecord {
        description: "fs snapshot".into(),
        start_time: clock.now(),
        contents: vec![id],
    };
    repo.manifests()
        .put(labels, &serde_json::to_vec(&record).unwrap())
        .unwrap();
    repo.close().unwrap();

    let reopened = Repository::open(
        storage as Arc<dyn BlobStorage>,
        PASSWORD,
        repo_options(&clock),
    )
    .unwrap();
    assert_eq!(reopened.contents().read(&id).unwrap(), b"on disk");

    // Maintenance leaves snapshot-referenced contents alone.
    clock.advance(Duration::hours(25));
    reopened
        .run_maintenance(
            MaintenanceMode::Full,
            &RunParameters {
                parallelism: 2,
                ..Default::default()
            },
            &CancelToken::never(),
        )
        .unwrap();
    reopened.refresh().unwrap();
    assert_eq!(reopened.contents().read(&id).unwrap(), b"on disk");
}
