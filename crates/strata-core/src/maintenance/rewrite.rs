use std::collections::{HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use strata_types::blob_id::BlobId;
use strata_types::error::Result;

use crate::cancel::CancelToken;
use crate::content::index::IndexEntry;
use crate::content::ContentManager;
use crate::workpool::WorkerPool;

use super::RunParameters;

/// A pack is "short" below this fraction of the maximum pack size.
const SHORT_PACK_FRACTION: u64 = 60;

/// Outcome of a content rewrite pass.
#[derive(Debug, Default, Clone)]
pub struct RewriteStats {
    pub candidates: u64,
    pub rewritten: u64,
    pub failed: u64,
    pub failures: Vec<String>,
}

/// Select and rewrite contents sitting in short packs, plus tombstoned
/// contents, so their old packs drain to orphans.
///
/// Contents younger than `rewrite_min_age` are left alone; a concurrent
/// writer may still be referencing their packs from an unflushed session.
/// Returns the stats and the packs the rewrites orphaned.
pub fn rewrite_contents(
    contents: &Arc<ContentManager>,
    now: DateTime<Utc>,
    params: &RunParameters,
    cancel: &CancelToken,
) -> Result<(RewriteStats, Vec<BlobId>)> {
    let view = contents.committed_view();
    let age_cutoff = (now - params.rewrite_min_age).timestamp();
    let short_threshold = contents.max_pack_size() as u64 * SHORT_PACK_FRACTION / 100;

    // Live bytes per pack decide which packs are short; packs holding any
    // live content are the ones worth draining.
    let mut pack_live_bytes: HashMap<BlobId, u64> = HashMap::new();
    for entry in view.entries() {
        if !entry.deleted && !entry.pack_blob_id.as_str().is_empty() {
            *pack_live_bytes.entry(entry.pack_blob_id.clone()).or_default() +=
                entry.packed_length as u64;
        }
    }

    let mut candidates: Vec<IndexEntry> = Vec::new();
    view.iterate(Bound::Unbounded, true, &mut |entry| {
        if entry.pack_blob_id.as_str().is_empty() || entry.timestamp_seconds > age_cutoff {
            return Ok(());
        }
        let live_bytes = pack_live_bytes.get(&entry.pack_blob_id).copied();
        if entry.deleted {
            // Tombstones move out of packs that still carry live data, so
            // those packs can drain. A pack holding only tombstoned
            // contents drains by index drop instead; rewriting it would
            // reset tombstone timestamps and push the safe drop time out
            // forever.
            if live_bytes.is_some() {
                candidates.push(entry.clone());
            }
            return Ok(());
        }
        if params.rewrite_short_packs && live_bytes.is_some_and(|total| total < short_threshold) {
            candidates.push(entry.clone());
        }
        Ok(())
    })?;

    let mut stats = RewriteStats {
        candidates: candidates.len() as u64,
        ..Default::default()
    };
    if candidates.is_empty() {
        return Ok((stats, Vec::new()));
    }

    let failures: Arc<Mutex<Vec<(IndexEntry, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let rewritten: Arc<Mutex<Vec<IndexEntry>>> = Arc::new(Mutex::new(Vec::new()));

    let pool = WorkerPool::new(params.parallelism);
    for entry in candidates {
        let contents = Arc::clone(contents);
        let failures = Arc::clone(&failures);
        let rewritten = Arc::clone(&rewritten);
        let cancel = cancel.clone();
        pool.submit(move || {
            if cancel.is_cancelled() {
                return;
            }
            match contents.rewrite_entry(&entry) {
                Ok(()) => rewritten.lock().unwrap().push(entry),
                Err(e) => failures.lock().unwrap().push((entry, e.to_string())),
            }
        });
    }
    pool.join();
    cancel.check()?;

    let rewritten = Arc::try_unwrap(rewritten)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();
    let failures = Arc::try_unwrap(failures)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();

    stats.rewritten = rewritten.len() as u64;
    for (entry, message) in failures {
        if entry.deleted && params.ignore_rewrite_errors {
            // Deleted contents that fail to move are on their way out
            // anyway; the operator opted in to ignoring them.
            warn!(content = %entry.content_id, "ignoring rewrite failure of deleted content: {message}");
            continue;
        }
        stats.failed += 1;
        stats
            .failures
            .push(format!("{}: {message}", entry.content_id));
    }

    // Make the fresh entries durable before reporting packs as orphaned.
    contents.flush()?;

    let orphaned: HashSet<BlobId> = rewritten.into_iter().map(|e| e.pack_blob_id).collect();
    info!(
        candidates = stats.candidates,
        rewritten = stats.rewritten,
        failed = stats.failed,
        orphaned_packs = orphaned.len(),
        "content rewrite complete"
    );
    Ok((stats, orphaned.into_iter().collect()))
}
