use std::sync::Arc;

use chrono::Utc;

use strata_types::error::StrataError;

use crate::blob::memory::MemoryStorage;
use crate::blob::BlobStorage;
use crate::compress::Compression;
use crate::format::UpgradeLock;
use crate::repo::Repository;
use crate::testutil::*;

#[test]
fn create_rejects_existing_repository() {
    let (storage, clock, repo) = new_test_repo();
    drop(repo);
    let result = Repository::create(
        storage as Arc<dyn BlobStorage>,
        TEST_PASSWORD,
        &test_format_options(),
        test_repo_options(&clock),
    );
    assert!(result.is_err());
}

#[test]
fn open_with_wrong_password_fails() {
    let (storage, clock, repo) = new_test_repo();
    drop(repo);
    let result = Repository::open(
        storage as Arc<dyn BlobStorage>,
        "not-the-password",
        test_repo_options(&clock),
    );
    assert!(matches!(result, Err(StrataError::MacFailed)));
}

#[test]
fn change_password() {
    let (storage, clock, repo) = new_test_repo();
    let id = repo
        .contents()
        .write(b"before change", None, Compression::None)
        .unwrap();
    repo.change_password(TEST_PASSWORD, "brand-new").unwrap();
    repo.close().unwrap();

    assert!(Repository::open(
        storage.clone() as Arc<dyn BlobStorage>,
        TEST_PASSWORD,
        test_repo_options(&clock),
    )
    .is_err());

    let reopened = Repository::open(
        storage as Arc<dyn BlobStorage>,
        "brand-new",
        test_repo_options(&clock),
    )
    .unwrap();
    // Contents written before the change stay readable: the master key is
    // only rewrapped, never rotated.
    assert_eq!(reopened.contents().read(&id).unwrap(), b"before change");
}

#[test]
fn read_only_session_rejects_writes() {
    let (storage, clock, repo) = new_test_repo();
    let id = repo
        .contents()
        .write(b"existing", None, Compression::None)
        .unwrap();
    repo.close().unwrap();

    let mut opts = test_repo_options(&clock);
    opts.read_only = true;
    let ro = Repository::open(storage as Arc<dyn BlobStorage>, TEST_PASSWORD, opts).unwrap();
    assert_eq!(ro.contents().read(&id).unwrap(), b"existing");
    assert!(matches!(
        ro.contents().write(b"nope", None, Compression::None),
        Err(StrataError::ReadOnly)
    ));
    assert!(matches!(
        ro.contents().delete(&id),
        Err(StrataError::ReadOnly)
    ));
}

#[test]
fn refresh_observes_other_sessions_flush() {
    let (storage, clock, writer) = new_test_repo();
    let reader = open_test_repo(&storage, &clock);

    let id = writer
        .contents()
        .write(b"cross-session", None, Compression::None)
        .unwrap();
    writer.flush().unwrap();

    // Before refresh, the reader's merged view predates the flush.
    assert!(reader.contents().read(&id).is_err());

    // The reader's private list cache masks the new index blob until its
    // TTL passes (the writer only invalidated its own cache).
    clock.advance(chrono::Duration::seconds(31));
    reader.refresh().unwrap();
    assert_eq!(reader.contents().read(&id).unwrap(), b"cross-session");
}

#[test]
fn upgrade_lock_blocks_and_rolls_back() {
    let clock = fake_clock();
    let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
    let mut format_opts = test_format_options();
    format_opts.format_version = 1;
    let repo = Repository::create(
        storage.clone() as Arc<dyn BlobStorage>,
        TEST_PASSWORD,
        &format_opts,
        test_repo_options(&clock),
    )
    .unwrap();

    let original_version = repo.format_version();
    assert_eq!(original_version, 1);
    repo.set_upgrade_lock(UpgradeLock {
        owner_id: "admin@testhost".into(),
        created_at: Utc::now(),
        advance_notice_seconds: 600,
        new_format_version: 2,
    })
    .unwrap();
    assert_eq!(repo.format_version(), 2);

    repo.rollback_upgrade().unwrap();
    assert_eq!(repo.format_version(), original_version);
    assert_eq!(count_blobs(&*storage, "strata.repository.backup."), 0);
}

#[test]
fn identity_is_user_at_host() {
    let (_storage, _clock, repo) = new_test_repo();
    assert_eq!(repo.identity(), "tester@testhost");
}

#[test]
fn shared_list_cache_sees_local_invalidation() {
    let clock = fake_clock();
    let backend = Arc::new(MemoryStorage::with_clock(clock.clone()));
    let shared_cache: Arc<dyn BlobStorage> = Arc::new(MemoryStorage::with_clock(clock.clone()));

    let mut opts_a = test_repo_options(&clock);
    opts_a.cache_storage = Some(shared_cache.clone());
    opts_a.caching.max_list_cache_seconds = 60;
    let a = Repository::create(
        backend.clone() as Arc<dyn BlobStorage>,
        TEST_PASSWORD,
        &test_format_options(),
        opts_a,
    )
    .unwrap();

    let mut opts_b = test_repo_options(&clock);
    opts_b.cache_storage = Some(shared_cache);
    opts_b.caching.max_list_cache_seconds = 60;
    let b = Repository::open(
        backend as Arc<dyn BlobStorage>,
        TEST_PASSWORD,
        opts_b,
    )
    .unwrap();

    // Session B has listed `n` already (at open), priming the shared cache.
    let id = a
        .contents()
        .write(b"invalidate the cache", None, Compression::None)
        .unwrap();
    a.flush().unwrap();

    // Well inside the TTL, B must still observe the new index blob because
    // A's local PUT dropped the shared cached listing for prefix `n`.
    b.refresh().unwrap();
    assert_eq!(b.contents().read(&id).unwrap(), b"invalidate the cache");
}
