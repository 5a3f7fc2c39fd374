use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::blob::memory::MemoryStorage;
use crate::blob::BlobStorage;
use crate::clock::{Clock, FakeClock};
use crate::crypto::keyderiv::KeyDerivationAlgorithm;
use crate::format::FormatOptions;
use crate::maintenance::RunParameters;
use crate::repo::{Repository, RepositoryOptions};

pub(crate) const TEST_PASSWORD: &str = "pw";

/// Fake clock starting at a fixed instant.
pub(crate) fn fake_clock() -> Arc<FakeClock> {
    Arc::new(FakeClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    ))
}

/// Format options with the cheap KDF so tests don't pay scrypt per open.
pub(crate) fn test_format_options() -> FormatOptions {
    FormatOptions {
        key_derivation_algorithm: KeyDerivationAlgorithm::TestingOnlyInsecure,
        ..Default::default()
    }
}

pub(crate) fn test_repo_options(clock: &Arc<FakeClock>) -> RepositoryOptions {
    RepositoryOptions {
        clock: clock.clone(),
        username: "tester".into(),
        hostname: "testhost".into(),
        ..Default::default()
    }
}

/// A fresh in-memory repository driven by a fake clock.
pub(crate) fn new_test_repo() -> (Arc<MemoryStorage>, Arc<FakeClock>, Repository) {
    let clock = fake_clock();
    let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
    let repo = Repository::create(
        storage.clone(),
        TEST_PASSWORD,
        &test_format_options(),
        test_repo_options(&clock),
    )
    .expect("failed to create test repo");
    (storage, clock, repo)
}

/// Open a second session against the same storage and clock.
pub(crate) fn open_test_repo(storage: &Arc<MemoryStorage>, clock: &Arc<FakeClock>) -> Repository {
    Repository::open(
        storage.clone() as Arc<dyn BlobStorage>,
        TEST_PASSWORD,
        test_repo_options(clock),
    )
    .expect("failed to open test repo")
}

pub(crate) fn count_blobs(storage: &dyn BlobStorage, prefix: &str) -> usize {
    crate::blob::list_all(storage, prefix).unwrap().len()
}

/// Maintenance parameters with a small worker pool for tests; safety
/// timings stay at production defaults so tests exercise the real gates.
pub(crate) fn test_maintenance_params() -> RunParameters {
    RunParameters {
        parallelism: 2,
        owner: "tester@testhost".into(),
        ..Default::default()
    }
}

/// The fake clock as a `Clock` trait object.
pub(crate) fn as_clock(clock: &Arc<FakeClock>) -> Arc<dyn Clock> {
    clock.clone()
}
