use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use strata_types::content_id::ContentId;
use strata_types::error::Result;

use crate::cancel::CancelToken;
use crate::content::ContentManager;
use crate::manifest::{ManifestStore, TYPE_LABEL};
use crate::throttle::Throttle;

use super::RunParameters;

/// Manifest type of snapshot roots.
pub const SNAPSHOT_MANIFEST_TYPE: &str = "snapshot";

/// Produces the set of contents reachable from live snapshot roots.
///
/// The snapshot layer (walker, object tree) lives outside the engine; it
/// plugs in here. The default implementation reads the flat content lists
/// recorded in `type=snapshot` manifests.
pub trait LiveContentSource {
    fn live_contents(&self) -> Result<HashSet<ContentId>>;
}

/// Payload of a `type=snapshot` manifest, as far as the engine needs it:
/// the contents the snapshot keeps alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub contents: Vec<ContentId>,
}

/// Default liveness source: every content named by any live snapshot
/// manifest.
pub struct SnapshotManifestSource<'a> {
    manifests: &'a ManifestStore,
}

impl<'a> SnapshotManifestSource<'a> {
    pub fn new(manifests: &'a ManifestStore) -> Self {
        Self { manifests }
    }
}

impl LiveContentSource for SnapshotManifestSource<'_> {
    fn live_contents(&self) -> Result<HashSet<ContentId>> {
        let mut filter = BTreeMap::new();
        filter.insert(TYPE_LABEL.to_string(), SNAPSHOT_MANIFEST_TYPE.to_string());

        let mut live = HashSet::new();
        for entry in self.manifests.find(&filter) {
            let (_, record) = self.manifests.get_typed::<SnapshotRecord>(&entry.id)?;
            live.extend(record.contents);
        }
        Ok(live)
    }
}

/// Outcome of a snapshot GC mark phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub examined: u64,
    pub live: u64,
    pub too_young: u64,
    pub tombstoned: u64,
}

/// Mark phase: tombstone every content old enough for GC that no live
/// snapshot references. Never touches contents younger than
/// `min_content_age_subject_to_gc` — a concurrent uploader may be about to
/// reference them.
pub fn run_snapshot_gc(
    contents: &Arc<ContentManager>,
    source: &dyn LiveContentSource,
    now: DateTime<Utc>,
    params: &RunParameters,
    cancel: &CancelToken,
) -> Result<GcStats> {
    let live = source.live_contents()?;
    let age_cutoff = (now - params.min_content_age_subject_to_gc).timestamp();

    let mut stats = GcStats::default();
    let mut to_delete: Vec<ContentId> = Vec::new();
    let progress = Throttle::new();
    contents.iterate(Bound::Unbounded, false, &mut |entry| {
        cancel.check()?;
        stats.examined += 1;
        if progress.should_output(std::time::Duration::from_secs(5)) {
            info!(examined = stats.examined, marked = to_delete.len(), "gc scan progress");
        }
        if live.contains(&entry.content_id) {
            stats.live += 1;
            return Ok(());
        }
        if entry.timestamp_seconds > age_cutoff {
            stats.too_young += 1;
            return Ok(());
        }
        to_delete.push(entry.content_id);
        Ok(())
    })?;

    for id in to_delete {
        cancel.check()?;
        contents.delete(&id)?;
        stats.tombstoned += 1;
    }

    info!(
        examined = stats.examined,
        live = stats.live,
        too_young = stats.too_young,
        tombstoned = stats.tombstoned,
        "snapshot gc mark phase complete"
    );
    Ok(stats)
}
