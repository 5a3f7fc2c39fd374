pub mod blob_gc;
pub mod gc;
pub mod rewrite;
pub mod schedule;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use strata_types::error::{Result, StrataError};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::content::ContentManager;
use crate::manifest::ManifestStore;

use self::blob_gc::{CompactionResult, OrphanStats};
use self::gc::{GcStats, LiveContentSource};
use self::rewrite::RewriteStats;
use self::schedule::{acquire_lease, load_schedule, release_lease, save_schedule};

/// Maintenance depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceMode {
    /// Index compaction and housekeeping only.
    Quick,
    /// Quick plus snapshot GC, content rewrite, tombstone dropping, and
    /// orphaned blob deletion.
    Full,
}

/// Safety timing and execution parameters of a maintenance run.
///
/// The defaults mirror long-standing production values; operators widen
/// them when clients may run with stale caches for longer. Narrowing below
/// the defaults shrinks the window other clients have to observe state
/// before deletion and is not recommended.
#[derive(Debug, Clone)]
pub struct RunParameters {
    /// Contents younger than this are never tombstoned by GC.
    pub min_content_age_subject_to_gc: Duration,
    /// Contents younger than this are never rewritten.
    pub rewrite_min_age: Duration,
    /// A rewritten-away pack waits at least this long before deletion.
    pub min_rewrite_to_orphan_deletion_delay: Duration,
    /// A pack blob must be at least this old to be deleted.
    pub blob_delete_min_age: Duration,
    /// Minimum spacing between the two GC runs that confirm a deletion.
    pub margin_between_snapshot_gc: Duration,
    /// Extra wait before a tombstone may leave the index.
    pub drop_content_from_index_extra_margin: Duration,
    /// Require deletions to be observed by two consecutive GC runs.
    pub require_two_gc_cycles: bool,
    /// Rewrite contents out of short packs (not only tombstoned ones).
    pub rewrite_short_packs: bool,
    /// Ignore rewrite failures of already-deleted contents. Explicit
    /// opt-in; never read from the environment.
    pub ignore_rewrite_errors: bool,
    /// Worker count for the rewrite pool.
    pub parallelism: usize,
    /// Identity recorded in the lease manifest.
    pub owner: String,
    /// Lease TTL; an abandoned lease expires after this.
    pub lease_ttl: Duration,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            min_content_age_subject_to_gc: Duration::hours(24),
            rewrite_min_age: Duration::hours(2),
            min_rewrite_to_orphan_deletion_delay: Duration::hours(1),
            blob_delete_min_age: Duration::hours(24),
            margin_between_snapshot_gc: Duration::hours(4),
            drop_content_from_index_extra_margin: Duration::hours(1),
            require_two_gc_cycles: true,
            rewrite_short_packs: true,
            ignore_rewrite_errors: false,
            parallelism: 16,
            owner: "maintenance@localhost".into(),
            lease_ttl: Duration::hours(1),
        }
    }
}

/// Latest tombstone timestamp that is safe to drop from the index, given
/// the history of successful GC run start times (oldest first).
///
/// Requires two sufficiently-spaced GC runs (one, when
/// `require_two_gc_cycles` is off) and returns
/// `previous GC start − drop_content_from_index_extra_margin`.
///
/// Note: at minimum spacings a tombstone can be dropped while its pack
/// blob still exists, leaving a window in which a client holding a stale
/// in-memory index reports "content not found" for data that is still
/// present. The parameters above let an operator widen the margins; the
/// algorithm itself is kept as-is.
pub fn find_safe_drop_time(gc_runs: &[DateTime<Utc>], params: &RunParameters) -> Option<DateTime<Utc>> {
    if params.require_two_gc_cycles {
        if gc_runs.len() < 2 {
            return None;
        }
        let newest = gc_runs[gc_runs.len() - 1];
        let previous = gc_runs[gc_runs.len() - 2];
        if newest - previous < params.margin_between_snapshot_gc {
            return None;
        }
        Some(previous - params.drop_content_from_index_extra_margin)
    } else {
        gc_runs
            .last()
            .map(|newest| *newest - params.drop_content_from_index_extra_margin)
    }
}

/// Aggregate outcome of one maintenance run.
#[derive(Debug, Default)]
pub struct MaintenanceSummary {
    pub gc: Option<GcStats>,
    pub rewrite: Option<RewriteStats>,
    pub compaction: Option<CompactionResult>,
    pub orphans: Option<OrphanStats>,
    pub superseded_deleted: u64,
    pub manifest_blobs_superseded: usize,
}

/// Run maintenance under the exclusive lease.
///
/// Task failures abort the failing task only; the remaining tasks run and
/// the composite error is returned at the end, after the schedule is saved
/// and the lease released.
pub fn run(
    contents: &Arc<ContentManager>,
    manifests: &ManifestStore,
    clock: &Arc<dyn Clock>,
    live_source: &dyn LiveContentSource,
    mode: MaintenanceMode,
    params: &RunParameters,
    cancel: &CancelToken,
) -> Result<MaintenanceSummary> {
    let lease = acquire_lease(manifests, clock, &params.owner, params.lease_ttl)?;
    let result = run_under_lease(contents, manifests, clock, live_source, mode, params, cancel);
    if let Err(e) = release_lease(manifests, lease) {
        warn!("unable to release maintenance lease: {e}");
    }
    result
}

fn run_under_lease(
    contents: &Arc<ContentManager>,
    manifests: &ManifestStore,
    clock: &Arc<dyn Clock>,
    live_source: &dyn LiveContentSource,
    mode: MaintenanceMode,
    params: &RunParameters,
    cancel: &CancelToken,
) -> Result<MaintenanceSummary> {
    contents.refresh()?;
    manifests.refresh()?;
    let mut schedule = load_schedule(manifests)?;
    let mut summary = MaintenanceSummary::default();
    let mut failures: Vec<String> = Vec::new();
    let start = clock.now();
    info!(?mode, "maintenance run starting");

    if mode == MaintenanceMode::Full {
        // Mark phase. Tombstones flush so later phases observe them.
        cancel.check()?;
        match gc::run_snapshot_gc(contents, live_source, clock.now(), params, cancel) {
            Ok(stats) => {
                schedule.record_gc_run(start);
                summary.gc = Some(stats);
                if let Err(e) = contents.flush().and_then(|()| contents.refresh()) {
                    failures.push(format!("gc flush: {e}"));
                }
            }
            Err(e) => failures.push(format!("snapshot gc: {e}")),
        }

        // Drain short packs and moved tombstones into fresh packs.
        cancel.check()?;
        match rewrite::rewrite_contents(contents, clock.now(), params, cancel) {
            Ok((stats, orphaned)) => {
                for pack in orphaned {
                    schedule.record_rewrite(pack, clock.now());
                }
                if !stats.failures.is_empty() {
                    failures.extend(stats.failures.iter().cloned());
                }
                summary.rewrite = Some(stats);
                if let Err(e) = contents.refresh() {
                    failures.push(format!("rewrite refresh: {e}"));
                }
            }
            Err(e) => failures.push(format!("content rewrite: {e}")),
        }
    }

    // Index compaction; in full mode also drop tombstones past the safe
    // drop time.
    cancel.check()?;
    let drop_before = match mode {
        MaintenanceMode::Full => find_safe_drop_time(&schedule.gc_runs, params),
        MaintenanceMode::Quick => None,
    };
    match blob_gc::compact_indexes(contents, drop_before, drop_before.is_some()) {
        Ok(result) => {
            for blob in &result.superseded {
                schedule.record_superseded(blob.clone(), clock.now());
            }
            summary.compaction = Some(result);
            if let Err(e) = contents.refresh() {
                failures.push(format!("compaction refresh: {e}"));
            }
        }
        Err(e) => failures.push(format!("index compaction: {e}")),
    }

    // Manifest index compaction.
    cancel.check()?;
    match manifests.compact() {
        Ok(superseded) => {
            summary.manifest_blobs_superseded = superseded.len();
            for blob in superseded {
                schedule.record_superseded(blob, clock.now());
            }
        }
        Err(e) => failures.push(format!("manifest compaction: {e}")),
    }

    // Superseded blobs recorded long enough ago are deleted now.
    cancel.check()?;
    match blob_gc::delete_superseded_blobs(contents, &mut schedule, clock.now(), params) {
        Ok(count) => {
            summary.superseded_deleted = count;
            if count > 0 {
                // The merged view must not keep entries from deleted
                // indexes; orphan detection below reads the fresh view.
                if let Err(e) = contents.refresh() {
                    failures.push(format!("post-deletion refresh: {e}"));
                }
            }
        }
        Err(e) => failures.push(format!("superseded deletion: {e}")),
    }

    if mode == MaintenanceMode::Full {
        cancel.check()?;
        match blob_gc::delete_orphaned_blobs(contents, manifests, &mut schedule, clock.now(), params)
        {
            Ok(stats) => summary.orphans = Some(stats),
            Err(e) => failures.push(format!("orphaned blob deletion: {e}")),
        }
    }

    // A full run covers everything a quick run does.
    schedule.last_run.insert("quick".to_string(), start);
    if mode == MaintenanceMode::Full {
        schedule.last_run.insert("full".to_string(), start);
    }
    if let Err(e) = save_schedule(manifests, &schedule) {
        failures.push(format!("schedule save: {e}"));
    }

    if failures.is_empty() {
        info!(?mode, "maintenance run complete");
        Ok(summary)
    } else {
        Err(StrataError::MaintenanceFailed(failures))
    }
}

/// Intervals driving auto-mode scheduling.
#[derive(Debug, Clone)]
pub struct TaskIntervals {
    pub quick: Duration,
    pub full: Duration,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            quick: Duration::hours(1),
            full: Duration::hours(24),
        }
    }
}

/// Run whichever maintenance mode is due, if any. Full takes priority.
pub fn run_auto(
    contents: &Arc<ContentManager>,
    manifests: &ManifestStore,
    clock: &Arc<dyn Clock>,
    live_source: &dyn LiveContentSource,
    params: &RunParameters,
    intervals: &TaskIntervals,
    cancel: &CancelToken,
) -> Result<Option<MaintenanceSummary>> {
    let schedule = load_schedule(manifests)?;
    let now = clock.now();
    let due = |task: &str, interval: Duration| match schedule.last_run.get(task) {
        Some(last) => now - *last >= interval,
        None => true,
    };

    let mode = if due("full", intervals.full) {
        MaintenanceMode::Full
    } else if due("quick", intervals.quick) {
        MaintenanceMode::Quick
    } else {
        return Ok(None);
    };
    run(contents, manifests, clock, live_source, mode, params, cancel).map(Some)
}
