use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_types::blob_id::BlobId;
use strata_types::error::{Result, StrataError};
use strata_types::manifest_id::ManifestId;

use crate::clock::Clock;
use crate::manifest::{ManifestStore, TYPE_LABEL};

/// Manifest type of the maintenance schedule singleton.
pub const SCHEDULE_MANIFEST_TYPE: &str = "maintenance";
/// Manifest type of the exclusive maintenance lease.
pub const LEASE_MANIFEST_TYPE: &str = "maintenance-lease";

/// One rewrite audit record: a pack orphaned by content rewrite and when
/// the rewrite completed. Orphan deletion must wait a further delay from
/// this time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteAuditEntry {
    pub pack_blob_id: BlobId,
    pub completed_at: DateTime<Utc>,
}

/// A blob superseded by compaction, deletable once it has aged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupersededRecord {
    pub blob_id: BlobId,
    pub recorded_at: DateTime<Utc>,
}

/// Persistent maintenance state, stored as the `type=maintenance` manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceSchedule {
    /// Per-task completion times, for auto-mode interval checks.
    #[serde(default)]
    pub last_run: BTreeMap<String, DateTime<Utc>>,
    /// Start times of successful snapshot GC runs, oldest first.
    #[serde(default)]
    pub gc_runs: Vec<DateTime<Utc>>,
    /// Rewrite audit log consulted by orphan blob deletion.
    #[serde(default)]
    pub rewrites: Vec<RewriteAuditEntry>,
    /// Index and manifest-index blobs superseded by compaction.
    #[serde(default)]
    pub superseded: Vec<SupersededRecord>,
}

/// Cap on retained GC history entries.
const MAX_GC_RUNS: usize = 16;

impl MaintenanceSchedule {
    /// Record a successful snapshot GC start time.
    pub fn record_gc_run(&mut self, start: DateTime<Utc>) {
        self.gc_runs.push(start);
        if self.gc_runs.len() > MAX_GC_RUNS {
            let excess = self.gc_runs.len() - MAX_GC_RUNS;
            self.gc_runs.drain(..excess);
        }
    }

    pub fn record_rewrite(&mut self, pack_blob_id: BlobId, completed_at: DateTime<Utc>) {
        self.rewrites.push(RewriteAuditEntry {
            pack_blob_id,
            completed_at,
        });
    }

    pub fn record_superseded(&mut self, blob_id: BlobId, recorded_at: DateTime<Utc>) {
        self.superseded.push(SupersededRecord {
            blob_id,
            recorded_at,
        });
    }

    /// Earliest moment orphan deletion may remove `pack`, as constrained by
    /// the rewrite audit log (`None` when the pack was never rewritten).
    pub fn rewrite_completed_at(&self, pack: &BlobId) -> Option<DateTime<Utc>> {
        self.rewrites
            .iter()
            .filter(|r| r.pack_blob_id == *pack)
            .map(|r| r.completed_at)
            .max()
    }
}

fn schedule_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(TYPE_LABEL.to_string(), SCHEDULE_MANIFEST_TYPE.to_string());
    labels
}

/// Load the schedule singleton, or a default when none exists yet.
pub fn load_schedule(manifests: &ManifestStore) -> Result<MaintenanceSchedule> {
    let entries = manifests.find(&schedule_labels());
    let Some(entry) = entries.last() else {
        return Ok(MaintenanceSchedule::default());
    };
    let (_, schedule) = manifests.get_typed::<MaintenanceSchedule>(&entry.id)?;
    Ok(schedule)
}

/// Persist the schedule singleton, replacing prior versions.
pub fn save_schedule(manifests: &ManifestStore, schedule: &MaintenanceSchedule) -> Result<()> {
    let payload = serde_json::to_vec(schedule)?;
    manifests.replace(schedule_labels(), TYPE_LABEL, &payload)?;
    manifests.flush()
}

/// The exclusive claim a maintenance run holds while it works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceLease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Handle to a held lease; release with [`release_lease`].
#[derive(Debug)]
pub struct LeaseGuard {
    pub manifest_id: ManifestId,
    pub lease: MaintenanceLease,
}

fn lease_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(TYPE_LABEL.to_string(), LEASE_MANIFEST_TYPE.to_string());
    labels
}

/// Acquire the maintenance lease.
///
/// Writes a lease manifest, flushes it so other processes observe it, then
/// settles races deterministically: the unexpired lease with the earliest
/// `(acquired_at, manifest id)` wins, everyone else backs off with
/// `LockBusy`. An abandoned lease expires after its TTL and is ignored.
pub fn acquire_lease(
    manifests: &ManifestStore,
    clock: &Arc<dyn Clock>,
    owner: &str,
    ttl: Duration,
) -> Result<LeaseGuard> {
    let now = clock.now();

    // Fast path: an unexpired foreign lease means no attempt at all.
    if let Some((_, holder)) = find_active_leases(manifests, now)?.into_iter().next() {
        return Err(StrataError::LockBusy(holder.owner));
    }

    let lease = MaintenanceLease {
        owner: owner.to_string(),
        acquired_at: now,
        expires_at: now + ttl,
    };
    let manifest_id = manifests.put(lease_labels(), &serde_json::to_vec(&lease)?)?;
    manifests.flush()?;
    manifests.refresh()?;

    // Deterministic winner among racing claimants.
    let active = find_active_leases(manifests, clock.now())?;
    match active.first() {
        Some((winner_id, winner)) if *winner_id != manifest_id => {
            warn!(holder = %winner.owner, "lost maintenance lease race, backing off");
            manifests.delete(&manifest_id)?;
            manifests.flush()?;
            Err(StrataError::LockBusy(winner.owner.clone()))
        }
        _ => {
            debug!(owner, "acquired maintenance lease");
            Ok(LeaseGuard { manifest_id, lease })
        }
    }
}

/// Release a held lease.
pub fn release_lease(manifests: &ManifestStore, guard: LeaseGuard) -> Result<()> {
    manifests.delete(&guard.manifest_id)?;
    manifests.flush()
}

/// Unexpired leases sorted by `(acquired_at, manifest id)`.
fn find_active_leases(
    manifests: &ManifestStore,
    now: DateTime<Utc>,
) -> Result<Vec<(ManifestId, MaintenanceLease)>> {
    let mut active = Vec::new();
    for entry in manifests.find(&lease_labels()) {
        let (_, lease) = manifests.get_typed::<MaintenanceLease>(&entry.id)?;
        if lease.expires_at > now {
            active.push((entry.id, lease));
        }
    }
    active.sort_by(|a, b| {
        a.1.acquired_at
            .cmp(&b.1.acquired_at)
            .then_with(|| a.0.cmp(&b.0))
    });
    Ok(active)
}
