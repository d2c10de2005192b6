//! Eviction: tear down requests whose retention has lapsed and send their
//! files back to tape.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};

use crate::{
    allocator::recompute_used,
    error::NlaResult,
    model::{Stage, TapeFile, ALL_STAGES},
    notify::IndexUpdater,
    store::Store,
};

/// Name of the signpost link left in directories whose files were evicted.
pub const SIGNPOST_NAME: &str = "00FILES_ON_TAPE";

/// Re-resolution batch size over the requested path lists.
const RESOLVE_BATCH: usize = 100_000;

#[derive(Debug)]
pub struct TidySettings {
    /// what the signpost links point at (the human-readable explanation);
    /// `None` skips signposting, as in test deployments
    pub signpost_target: Option<PathBuf>,
}

/// What one tidy run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TidyOutcome {
    pub requests_removed: usize,
    pub files_evicted: usize,
    /// RESTORED rows whose payload had vanished; re-added by later ingestion
    pub rows_dropped: usize,
    /// files found modified since verification, sent back through the verifier
    pub reset_unverified: usize,
}

/// Evict every request whose retention has lapsed.
///
/// The request's file set is re-resolved from its requested paths in bounded
/// batches first, so eviction sees the files as they are now known. A file
/// survives eviction when any other unexpired request still wants it.
pub fn tidy_requests(
    store: &Store,
    index: &dyn IndexUpdater,
    settings: &TidySettings,
    now: DateTime<Utc>,
) -> NlaResult<TidyOutcome> {
    let mut outcome = TidyOutcome::default();
    let expired = store.expired_requests(now)?;
    info!("{} expired tape request(s)", expired.len());

    for request in &expired {
        // pattern requests have no path list; their resolved set stands
        if !request.request_files.is_empty() {
            store.in_transaction(|store| {
                store.clear_request_files(request.id)?;
                for batch in request.request_files.chunks(RESOLVE_BATCH) {
                    let present = store.files_by_paths(batch, &ALL_STAGES)?;
                    let ids: Vec<i64> = present.iter().map(|f| f.id).collect();
                    store.add_files_to_request(request.id, &ids)?;
                }
                Ok(())
            })?;
        }
    }

    let mut touched_disks = Vec::new();
    for request in &expired {
        info!("tidying request {} ({})", request.id, request.display_label());
        let mut to_remove = Vec::new();

        for file in store.request_files(request.id)? {
            let logical = Path::new(&file.logical_path);
            if !logical.exists() {
                if file.stage == Stage::Restored {
                    info!(
                        "restored file vanished from disk, dropping from the archive: {}",
                        file.logical_path
                    );
                    store.delete_file(file.id)?;
                    outcome.rows_dropped += 1;
                }
                continue;
            }

            if modified_since_verification(&file, logical) {
                info!("file modified after verification, resetting: {}", file.logical_path);
                store.in_transaction(|store| {
                    store.set_file_verified(file.id, None)?;
                    store.set_file_stage_and_disk(file.id, Stage::Unverified, None)
                })?;
                outcome.reset_unverified += 1;
                continue;
            }

            if store.file_in_live_request(file.id, now, Some(request.id))? {
                continue;
            }
            to_remove.push(file);
        }

        info!("removing {} file(s) from the restored area", to_remove.len());
        let mut removed_paths = Vec::new();
        for file in to_remove {
            place_signpost(settings, Path::new(&file.logical_path));
            match evict_file(store, &file) {
                Ok(()) => {
                    if let Some(disk) = file.restore_disk {
                        if !touched_disks.contains(&disk) {
                            touched_disks.push(disk);
                        }
                    }
                    removed_paths.push(file.logical_path.clone());
                    outcome.files_evicted += 1;
                }
                Err(err) => {
                    warn!("could not remove {}: {err}", file.logical_path);
                }
            }
        }
        if !removed_paths.is_empty() {
            index.set_locations(&removed_paths, false);
        }

        info!("removing request {}", request.id);
        store.delete_request(request.id)?;
        outcome.requests_removed += 1;
    }

    for disk in touched_disks {
        _ = recompute_used(store, disk)?;
    }
    Ok(outcome)
}

/// Has the real file been written since it was last verified?
fn modified_since_verification(file: &TapeFile, logical: &Path) -> bool {
    let Some(verified) = file.verified else {
        return false;
    };
    let Ok(meta) = fs::symlink_metadata(logical) else {
        return false;
    };
    if meta.file_type().is_symlink() {
        return false;
    }
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    let mtime: DateTime<Utc> = mtime.into();
    // verification timestamps are second-granular
    mtime > Utc.timestamp_opt(verified.timestamp() + 1, 0).single().unwrap_or(verified)
}

/// Leave one signpost per directory explaining where the files went.
fn place_signpost(settings: &TidySettings, logical: &Path) {
    let Some(target) = settings.signpost_target.as_deref() else {
        return;
    };
    let Some(dir) = logical.parent() else {
        return;
    };
    let signpost = dir.join(SIGNPOST_NAME);
    if fs::symlink_metadata(&signpost).is_ok() {
        return;
    }
    if let Err(err) = std::os::unix::fs::symlink(target, &signpost) {
        warn!("could not create signpost {}: {err}", signpost.display());
    }
}

/// Remove a file's disk presence and mark it back on tape.
///
/// RESTORED files are a symlink over a payload on a restore disk: both go.
/// Anything else (ONDISK, UNVERIFIED) is the real file at its logical path.
fn evict_file(store: &Store, file: &TapeFile) -> NlaResult<()> {
    let logical = Path::new(&file.logical_path);
    store.in_transaction(|store| {
        store.set_file_stage_and_disk(file.id, Stage::OnTape, None)
    })?;
    if file.stage == Stage::Restored {
        let payload = fs::read_link(logical)?;
        fs::remove_file(&payload)?;
        fs::remove_file(logical)?;
    } else {
        fs::remove_file(logical)?;
    }
    Ok(())
}
