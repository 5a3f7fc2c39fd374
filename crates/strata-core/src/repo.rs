use std::sync::{Arc, Mutex};

use chrono::Duration;
use tracing::{debug, info};

use strata_types::blob_id::BlobId;
use strata_types::error::{Result, StrataError};

use crate::blob::list_cache::ListCacheStorage;
use crate::blob::logging::LoggingStorage;
use crate::blob::memory::MemoryStorage;
use crate::blob::read_cache::ReadCachingStorage;
use crate::blob::retry::{RetryPolicy, RetryingStorage};
use crate::blob::BlobStorage;
use crate::cache::packed::PackedCache;
use crate::cancel::CancelToken;
use crate::clock::{system_clock, Clock};
use crate::config::CachingOptions;
use crate::content::{ContentManager, ContentManagerOptions};
use crate::crypto::Crypter;
use crate::format::{self, FormatOptions, RepositoryFormat, UpgradeLock, FORMAT_BLOB_ID};
use crate::maintenance::gc::SnapshotManifestSource;
use crate::maintenance::{self, MaintenanceMode, MaintenanceSummary, RunParameters};
use crate::manifest::ManifestStore;

/// Options for opening a repository session.
#[derive(Clone)]
pub struct RepositoryOptions {
    pub clock: Arc<dyn Clock>,
    pub caching: CachingOptions,
    pub retry: RetryPolicy,
    pub read_only: bool,
    pub username: String,
    pub hostname: String,
    /// Shared store for the list and metadata caches. Overrides the
    /// cache-dir-derived store; processes sharing one of these observe each
    /// other's cache invalidations.
    pub cache_storage: Option<Arc<dyn BlobStorage>>,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            clock: system_clock(),
            caching: CachingOptions::default(),
            retry: RetryPolicy::default(),
            read_only: false,
            username: std::env::var("USER").unwrap_or_else(|_| "user".into()),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            cache_storage: None,
        }
    }
}

/// An open session against a repository: the format blob loaded, the master
/// key unwrapped, the wrapper stack built, and the merged index and
/// manifest views constructed.
///
/// Read sessions see a snapshot-consistent view plus their own writes; a
/// write session persists its buffered state with [`Repository::flush`] or
/// discards it with [`Repository::abort`].
pub struct Repository {
    /// Unwrapped driver, used for format blob operations.
    base_storage: Arc<dyn BlobStorage>,
    /// Full wrapper stack: logging → retry → list cache → read cache.
    storage: Arc<dyn BlobStorage>,
    format: Mutex<RepositoryFormat>,
    crypter: Arc<Crypter>,
    contents: Arc<ContentManager>,
    manifests: ManifestStore,
    clock: Arc<dyn Clock>,
    username: String,
    hostname: String,
}

impl Repository {
    /// Create a new repository on empty storage and open a session on it.
    pub fn create(
        storage: Arc<dyn BlobStorage>,
        password: &str,
        format_opts: &FormatOptions,
        opts: RepositoryOptions,
    ) -> Result<Self> {
        match storage.get(&BlobId::from(FORMAT_BLOB_ID), 0, 0) {
            Err(e) if e.is_not_found() => {}
            Ok(_) => {
                return Err(StrataError::InvalidFormat(
                    "repository already exists in this storage".into(),
                ))
            }
            Err(e) => return Err(e),
        }

        let (repo_format, _master) = RepositoryFormat::initialize(password, format_opts)?;
        repo_format.store(&*storage)?;
        info!(
            unique_id = %hex::encode(&repo_format.unique_id),
            version = repo_format.format_version,
            "created repository"
        );
        Self::open(storage, password, opts)
    }

    /// Open an existing repository.
    pub fn open(
        storage: Arc<dyn BlobStorage>,
        password: &str,
        opts: RepositoryOptions,
    ) -> Result<Self> {
        let repo_format = RepositoryFormat::load(&*storage)?;
        let master = repo_format.unwrap_master_key(password)?;
        let crypter = Arc::new(Crypter::new(
            &master,
            repo_format.hash_algorithm,
            repo_format.encryption_algorithm,
            repo_format.hash_id_length,
        )?);

        // Cache stores: shared override, on-disk packed caches, or memory.
        let (meta_cache, content_cache): (Arc<dyn BlobStorage>, Arc<dyn BlobStorage>) =
            match (&opts.cache_storage, &opts.caching.cache_dir) {
                (Some(shared), _) => (
                    shared.clone(),
                    Arc::new(MemoryStorage::with_clock(opts.clock.clone())),
                ),
                (None, Some(dir)) => (
                    Arc::new(PackedCache::open_with_clock(
                        dir.join("metadata"),
                        opts.caching.max_metadata_cache_bytes,
                        opts.clock.clone(),
                    )?),
                    Arc::new(PackedCache::open_with_clock(
                        dir.join("contents"),
                        opts.caching.max_content_cache_bytes,
                        opts.clock.clone(),
                    )?),
                ),
                (None, None) => (
                    Arc::new(MemoryStorage::with_clock(opts.clock.clone())),
                    Arc::new(MemoryStorage::with_clock(opts.clock.clone())),
                ),
            };

        // Wrapper stack per the layering: driver → logging → retry →
        // list cache → read cache → consumers.
        let logged: Arc<dyn BlobStorage> = Arc::new(LoggingStorage::new(storage.clone()));
        let retried: Arc<dyn BlobStorage> =
            Arc::new(RetryingStorage::new(logged, opts.retry.clone()));
        let list_cached: Arc<dyn BlobStorage> = Arc::new(ListCacheStorage::new(
            retried,
            meta_cache.clone(),
            &["n", "m"],
            Duration::seconds(opts.caching.max_list_cache_seconds as i64),
            crypter.list_cache_secret(),
            opts.clock.clone(),
        ));
        let stacked: Arc<dyn BlobStorage> = Arc::new(ReadCachingStorage::new(
            list_cached,
            meta_cache,
            ReadCachingStorage::metadata_action(),
        ));

        let contents = Arc::new(ContentManager::open(
            stacked.clone(),
            crypter.clone(),
            opts.clock.clone(),
            ContentManagerOptions {
                format_version: repo_format.format_version,
                max_pack_size: repo_format.max_pack_size as usize,
                read_only: opts.read_only,
                content_cache: Some(content_cache),
            },
        )?);
        let manifests = ManifestStore::open(
            stacked.clone(),
            crypter.clone(),
            opts.clock.clone(),
            opts.read_only,
        )?;

        debug!(
            backend = %storage.display_name(),
            read_only = opts.read_only,
            "opened repository session"
        );
        Ok(Self {
            base_storage: storage,
            storage: stacked,
            format: Mutex::new(repo_format),
            crypter,
            contents,
            manifests,
            clock: opts.clock,
            username: opts.username,
            hostname: opts.hostname,
        })
    }

    pub fn contents(&self) -> &Arc<ContentManager> {
        &self.contents
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    pub fn crypter(&self) -> &Arc<Crypter> {
        &self.crypter
    }

    /// `username@hostname` identity of this session.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    pub fn unique_id(&self) -> Vec<u8> {
        self.format.lock().unwrap().unique_id.clone()
    }

    pub fn format_version(&self) -> u8 {
        self.format.lock().unwrap().format_version
    }

    /// Persist all buffered writes: content packs, an index blob, manifest
    /// payload packs, and a manifest-index blob.
    pub fn flush(&self) -> Result<()> {
        self.contents.flush()?;
        self.manifests.flush()
    }

    /// Re-list indexes and manifest indexes and merge anything new.
    pub fn refresh(&self) -> Result<()> {
        self.contents.refresh()?;
        self.manifests.refresh()
    }

    /// Discard all buffered writes.
    pub fn abort(&self) {
        self.contents.abort();
        self.manifests.abort();
    }

    /// Flush and end the session.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    /// Whether a flush would write anything.
    pub fn has_pending_writes(&self) -> bool {
        self.contents.has_pending_writes() || self.manifests.has_pending_writes()
    }

    /// Rewrap the master key under a new password.
    pub fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        let mut format = self.format.lock().unwrap();
        format.change_password(old_password, new_password)?;
        format.store(&*self.base_storage)
    }

    /// Place an upgrade lock owned by this session's identity.
    pub fn set_upgrade_lock(&self, lock: UpgradeLock) -> Result<()> {
        let mut format = self.format.lock().unwrap();
        format::set_upgrade_lock(&*self.base_storage, &mut format, lock)
    }

    /// Roll back an in-progress upgrade from the newest format backup.
    pub fn rollback_upgrade(&self) -> Result<()> {
        let restored = format::rollback_upgrade(&*self.base_storage)?;
        *self.format.lock().unwrap() = restored;
        Ok(())
    }

    /// Run maintenance with the default snapshot-manifest liveness source.
    pub fn run_maintenance(
        &self,
        mode: MaintenanceMode,
        params: &RunParameters,
        cancel: &CancelToken,
    ) -> Result<MaintenanceSummary> {
        let source = SnapshotManifestSource::new(&self.manifests);
        maintenance::run(
            &self.contents,
            &self.manifests,
            &self.clock,
            &source,
            mode,
            params,
            cancel,
        )
    }
}
