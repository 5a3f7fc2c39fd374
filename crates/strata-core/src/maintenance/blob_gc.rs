use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, info, warn};

use strata_types::blob_id::{
    BlobId, INDEX_PREFIX, MANIFEST_DATA_PREFIX, PACK_DATA_PREFIX, PACK_METADATA_PREFIX,
};
use strata_types::error::Result;

use crate::content::index::{encode_index, IndexEntry, INDEX_VERSION_1, INDEX_VERSION_2};
use crate::content::merged::MergedIndex;
use crate::content::{load_index_blobs, ContentManager};
use crate::manifest::ManifestStore;

use super::schedule::MaintenanceSchedule;
use super::RunParameters;

/// Outcome of an index compaction pass.
#[derive(Debug, Default, Clone)]
pub struct CompactionResult {
    pub replacement: Option<BlobId>,
    pub superseded: Vec<BlobId>,
    pub dropped_tombstones: u64,
}

/// Merge every current index blob into a single replacement.
///
/// Tombstones whose timestamp is at or before `drop_tombstones_before` are
/// omitted entirely (the safe-drop decision is the caller's). Superseded
/// blob ids are returned for delayed deletion, never deleted here. Without
/// `force`, a repository that already has a single index blob is left
/// alone.
pub fn compact_indexes(
    contents: &ContentManager,
    drop_tombstones_before: Option<DateTime<Utc>>,
    force: bool,
) -> Result<CompactionResult> {
    let blobs = load_index_blobs(&**contents.storage(), contents.crypter())?;
    if blobs.is_empty() || (blobs.len() == 1 && !force) {
        return Ok(CompactionResult::default());
    }

    let sources: Vec<BlobId> = blobs.iter().map(|(id, _)| id.clone()).collect();
    let merged = MergedIndex::build(blobs);

    let drop_cutoff = drop_tombstones_before.map(|t| t.timestamp());
    let mut dropped = 0u64;
    let entries: Vec<IndexEntry> = merged
        .entries()
        .iter()
        .filter(|e| {
            let droppable =
                e.deleted && drop_cutoff.is_some_and(|cutoff| e.timestamp_seconds <= cutoff);
            if droppable {
                dropped += 1;
            }
            !droppable
        })
        .cloned()
        .collect();

    if entries.is_empty() {
        // Everything was a droppable tombstone; the sources still go away.
        return Ok(CompactionResult {
            replacement: None,
            superseded: sources,
            dropped_tombstones: dropped,
        });
    }

    let version = if contents.format_version() == 1 {
        INDEX_VERSION_1
    } else {
        INDEX_VERSION_2
    };
    let payload = encode_index(version, &entries)?;
    // Random id: a compaction output must never collide with a source blob,
    // even when the logical entry set is unchanged.
    let replacement = random_index_blob_id();
    let encrypted = contents.crypter().encrypt_blob(&replacement, &payload)?;
    contents.storage().put(
        &replacement,
        &encrypted,
        &crate::blob::PutOptions::default(),
    )?;

    info!(
        replacement = %replacement,
        superseded = sources.len(),
        entries = entries.len(),
        dropped_tombstones = dropped,
        "compacted index blobs"
    );
    Ok(CompactionResult {
        replacement: Some(replacement),
        superseded: sources,
        dropped_tombstones: dropped,
    })
}

fn random_index_blob_id() -> BlobId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    BlobId::new(format!("{INDEX_PREFIX}{}", hex::encode(bytes)))
}

/// Delete superseded blobs whose compaction records have aged past
/// `blob_delete_min_age`. Returns the number deleted.
pub fn delete_superseded_blobs(
    contents: &ContentManager,
    schedule: &mut MaintenanceSchedule,
    now: DateTime<Utc>,
    params: &RunParameters,
) -> Result<u64> {
    let mut deleted = 0u64;
    let mut remaining = Vec::with_capacity(schedule.superseded.len());
    for record in schedule.superseded.drain(..) {
        if now - record.recorded_at < params.blob_delete_min_age {
            remaining.push(record);
            continue;
        }
        match contents.storage().delete(&record.blob_id) {
            Ok(()) => {
                debug!(blob = %record.blob_id, "deleted superseded blob");
                deleted += 1;
            }
            Err(e) if e.is_not_found() => deleted += 1,
            Err(e) => {
                warn!(blob = %record.blob_id, "unable to delete superseded blob: {e}");
                remaining.push(record);
            }
        }
    }
    schedule.superseded = remaining;
    Ok(deleted)
}

/// Outcome of an orphaned-blob deletion pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrphanStats {
    pub scanned: u64,
    pub referenced: u64,
    pub too_young: u64,
    pub awaiting_rewrite_delay: u64,
    pub deleted: u64,
}

/// Delete pack blobs no index or manifest entry references.
///
/// A pack is deletable only when it is unreferenced by the merged view
/// captured at the start of the pass, its backend timestamp is at least
/// `blob_delete_min_age` old, and any rewrite that orphaned it completed at
/// least `min_rewrite_to_orphan_deletion_delay` ago.
pub fn delete_orphaned_blobs(
    contents: &ContentManager,
    manifests: &ManifestStore,
    schedule: &mut MaintenanceSchedule,
    now: DateTime<Utc>,
    params: &RunParameters,
) -> Result<OrphanStats> {
    let mut referenced: HashSet<BlobId> = contents.committed_view().referenced_packs();
    referenced.extend(manifests.referenced_payload_packs());

    let mut stats = OrphanStats::default();
    let mut deleted_packs: HashSet<BlobId> = HashSet::new();

    for prefix in [PACK_DATA_PREFIX, PACK_METADATA_PREFIX, MANIFEST_DATA_PREFIX] {
        let metas = crate::blob::list_all(&**contents.storage(), &prefix.to_string())?;
        for meta in metas {
            stats.scanned += 1;
            if referenced.contains(&meta.id) {
                stats.referenced += 1;
                continue;
            }
            if now - meta.timestamp < params.blob_delete_min_age {
                stats.too_young += 1;
                continue;
            }
            if let Some(completed) = schedule.rewrite_completed_at(&meta.id) {
                if now - completed < params.min_rewrite_to_orphan_deletion_delay {
                    stats.awaiting_rewrite_delay += 1;
                    continue;
                }
            }
            match contents.storage().delete(&meta.id) {
                Ok(()) => {
                    debug!(blob = %meta.id, "deleted orphaned pack blob");
                    deleted_packs.insert(meta.id);
                    stats.deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(blob = %meta.id, "unable to delete orphaned blob: {e}"),
            }
        }
    }

    // Audit entries for deleted packs have served their purpose.
    schedule
        .rewrites
        .retain(|r| !deleted_packs.contains(&r.pack_blob_id));

    info!(
        scanned = stats.scanned,
        referenced = stats.referenced,
        too_young = stats.too_young,
        deleted = stats.deleted,
        "orphaned blob deletion complete"
    );
    Ok(stats)
}
