//! The retrieval executor: drive one slot through a full `sd_get` run.
//!
//! A slot with a freshly loaded request gets a restore disk, a listing of
//! its tape-resident files, and a child process. The child's progress log
//! is the completion channel: every `Saving …` line publishes one file by
//! symlinking its logical path to the restored payload. When the child has
//! exited and the log is drained the request is completed, or rewound for
//! another attempt if files are still missing.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use crate::{
    allocator::{choose_disk, recompute_used},
    error::{NlaResult, RetrieveErrorKind, StoreErrorKind},
    model::{RestoreDisk, Slot, Stage, TapeFile},
    notify::{IndexUpdater, Notifier},
    resolver::PathResolver,
    store::Store,
    tape::{parse_saved_line, LogTail, SpotCache, TapeClient},
};

/// Grace period before a started request without process details is rewound.
const UNSTARTED_GRACE_SECS: i64 = 120;

/// Everything the executor needs besides the store.
#[derive(Debug)]
pub struct RetrieveSettings {
    pub client: TapeClient,
    /// pause between log polls (10 s in production, short in tests)
    pub poll: Duration,
}

/// The local host name recorded on slots and compared by [`check_happy`].
pub fn local_host() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Process one tick of the retrieval task: rewind unhealthy started slots
/// and drive at most one freshly loaded slot through a retrieval.
///
/// The resolver tables are only fetched when a slot actually needs them.
pub fn run_tick(
    store: &Store,
    settings: &RetrieveSettings,
    notifier: &dyn Notifier,
    index: &dyn IndexUpdater,
    load_resolver: &dyn Fn() -> NlaResult<PathResolver>,
) -> NlaResult<()> {
    let mut resolver = None;
    for slot in store.slots()? {
        if slot.tape_request.is_none() {
            debug!("no request for slot {}", slot.id);
            continue;
        }
        if slot.pid.is_some() {
            debug!("request already active on slot {}", slot.id);
            check_happy(store, &slot)?;
            continue;
        }
        if resolver.is_none() {
            info!("loading storage paths");
            resolver = Some(load_resolver()?);
        }
        if let Some(resolver) = resolver.as_ref() {
            if start_retrieval(store, resolver, settings, notifier, index, &slot)? {
                break;
            }
        }
    }
    Ok(())
}

/// Run the retrieval for a loaded slot. Returns whether a subprocess was
/// actually started (one per tick bounds the work done by each process).
pub fn start_retrieval(
    store: &Store,
    resolver: &PathResolver,
    settings: &RetrieveSettings,
    notifier: &dyn Notifier,
    index: &dyn IndexUpdater,
    slot: &Slot,
) -> NlaResult<bool> {
    let request_id = slot.tape_request.ok_or(RetrieveErrorKind::SlotEmpty(slot.id))?;
    let now = Utc::now();

    let files = store.request_files_in_stages(request_id, &[Stage::OnTape])?;
    if files.is_empty() {
        // nothing left to pull: mark up as finished
        store.set_storaged_start(request_id, Some(now))?;
        complete_request(store, notifier, slot.id, request_id)?;
        return Ok(false);
    }

    let Some(disk) = choose_disk(store, request_id)? else {
        // request stays active and is retried once space frees up
        return Ok(false);
    };
    let mountpoint = PathBuf::from(&disk.mountpoint);
    fs::create_dir_all(&mountpoint)?;

    let (listing_path, to_restore) =
        create_retrieve_listing(store, resolver, settings, request_id, &disk, &files)?;
    if to_restore.is_empty() {
        // none of the files could be confirmed on tape: release the slot
        store.set_slot_request(slot.id, None)?;
        return Ok(false);
    }

    let request = store
        .request_by_id(request_id)?
        .ok_or(StoreErrorKind::NoSuchRequest(request_id))?;
    info!("start request {} on slot {}", request_id, slot.id);

    // started notification, once per request: skipped when a previous
    // attempt already restored something
    if store.count_request_files_in_stages(request_id, &[Stage::Restored])? == 0 {
        let paths: Vec<String> = store
            .request_files(request_id)?
            .into_iter()
            .map(|f| f.logical_path)
            .collect();
        notifier.request_started(&request, &paths);
    }

    let log_path = mountpoint.join(format!("retrieve_log_{request_id}.txt"));
    // an old log would be picked up as progress of this run
    if log_path.exists() {
        fs::remove_file(&log_path)?;
    }

    store.set_storaged_start(request_id, Some(now))?;
    let mut child = settings.client.start_retrieval(&log_path, &mountpoint, &listing_path)?;
    store.set_slot_process(slot.id, child.id(), &local_host(), &disk.mountpoint)?;

    wait_retrieval(
        store,
        settings,
        index,
        request_id,
        &disk,
        &mut child,
        LogTail::new(&log_path),
        &to_restore,
    )?;

    // finished notification once nothing is left to pull for the request
    if store.count_request_files_in_stages(request_id, &[Stage::OnTape, Stage::Restoring])? == 0 {
        let paths: Vec<String> = store
            .request_files(request_id)?
            .into_iter()
            .map(|f| f.logical_path)
            .collect();
        notifier.request_finished(&request, &paths);
    }

    if store.count_request_files_in_stages(request_id, &[Stage::Restoring])? == 0 {
        complete_request(store, notifier, slot.id, request_id)?;
    } else {
        info!("request {request_id} finished on tape side, but not all files retrieved yet");
        redo_request(store, slot.id)?;
    }
    Ok(true)
}

/// Write the listing consumed by `sd_get` and mark the included files as
/// RESTORING on the chosen disk.
///
/// Files whose fileset cannot be resolved or which cannot be confirmed in
/// their spot's `sd_ls` output are skipped, not fatal.
fn create_retrieve_listing(
    store: &Store,
    resolver: &PathResolver,
    settings: &RetrieveSettings,
    request_id: i64,
    disk: &RestoreDisk,
    files: &[TapeFile],
) -> NlaResult<(PathBuf, HashMap<String, TapeFile>)> {
    let listing_path =
        Path::new(&disk.mountpoint).join(format!("retrieve_listing_{request_id}.txt"));
    let mut listing = BufWriter::new(File::create(&listing_path)?);
    let mut to_restore = HashMap::new();
    let mut spots = SpotCache::new(&settings.client);

    for file in files {
        let (_, spot_name) = match resolver.resolve_spot(&file.logical_path) {
            Ok(found) => found,
            Err(err) => {
                warn!("spot name not found for file {}: {err}", file.logical_path);
                continue;
            }
        };
        let tape_side = resolver.tape_side_path(&file.logical_path, settings.client.test_mode)?;
        let Some(entries) = spots.entries(spot_name)? else {
            warn!("spot {spot_name} unknown to the tape system");
            continue;
        };
        let basename = tape_side.rsplit('/').next().unwrap_or(&tape_side);
        if !entries.contains_key(basename) {
            warn!("{tape_side} not present in spot {spot_name}, skipping");
            continue;
        }
        writeln!(listing, "{tape_side}")?;
        store.set_file_stage_and_disk(file.id, Stage::Restoring, Some(disk.id))?;
        _ = to_restore.insert(tape_side, file.clone());
    }
    listing.flush()?;
    Ok((listing_path, to_restore))
}

/// Follow the child process and its log until both are done, publishing a
/// symlink for every file the log reports as saved.
#[allow(clippy::too_many_arguments)]
fn wait_retrieval(
    store: &Store,
    settings: &RetrieveSettings,
    index: &dyn IndexUpdater,
    request_id: i64,
    disk: &RestoreDisk,
    child: &mut std::process::Child,
    mut tail: LogTail,
    to_restore: &HashMap<String, TapeFile>,
) -> NlaResult<()> {
    loop {
        // sleep first, to allow the process to start
        std::thread::sleep(settings.poll);
        let ended = child.try_wait()?.is_some();

        let mut restored = Vec::new();
        for line in tail.poll()? {
            let Some(saved) = parse_saved_line(&line, settings.client.test_mode) else {
                continue;
            };
            let Some(file) = to_restore.get(&saved.archive_path) else {
                warn!("log reports unrequested file {}", saved.archive_path);
                continue;
            };
            match publish_link(&file.logical_path, &saved.local_path) {
                Ok(()) => {
                    store.in_transaction(|store| {
                        store.set_first_on_disk_if_unset(request_id, Utc::now())?;
                        store.set_file_stage_and_disk(file.id, Stage::Restored, Some(disk.id))
                    })?;
                    _ = recompute_used(store, disk.id)?;
                    restored.push(file.logical_path.clone());
                }
                Err(err) => {
                    // file stays RESTORING; the reconciler picks it up
                    warn!(
                        "could not link {} to {}: {err}",
                        file.logical_path, saved.local_path
                    );
                }
            }
        }
        if !restored.is_empty() {
            index.set_locations(&restored, true);
        }
        if ended {
            return Ok(());
        }
    }
}

/// Point the logical path at the restored payload.
///
/// An existing symlink is replaced; an existing real file is a conflict and
/// refused.
pub fn publish_link(logical_path: &str, local_path: &str) -> NlaResult<()> {
    let logical = Path::new(logical_path);
    match fs::symlink_metadata(logical) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(logical)?,
        Ok(_) => return Err(RetrieveErrorKind::LinkConflict(logical.to_path_buf()).into()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    std::os::unix::fs::symlink(local_path, logical)?;
    Ok(())
}

/// Mark the request finished and return its slot to the pool.
pub fn complete_request(
    store: &Store,
    _notifier: &dyn Notifier,
    slot_id: i64,
    request_id: i64,
) -> NlaResult<()> {
    info!("completing request {request_id} on slot {slot_id}");
    let now = Utc::now();
    store.in_transaction(|store| {
        store.set_storaged_end(request_id, Some(now))?;
        store.set_last_on_disk(request_id, Some(now))?;
        store.free_slot(slot_id)
    })
}

/// Rewind a request so it is retried later: RESTORING files go back to
/// ONTAPE, the timing fields are cleared and the slot is freed.
pub fn redo_request(store: &Store, slot_id: i64) -> NlaResult<()> {
    let slot = store
        .slot_by_id(slot_id)?
        .ok_or(StoreErrorKind::NoSuchSlot(slot_id))?;
    let Some(request_id) = slot.tape_request else {
        return store.free_slot(slot_id);
    };
    info!("redoing request {request_id} on slot {slot_id}");
    store.in_transaction(|store| {
        for file in store.request_files_in_stages(request_id, &[Stage::Restoring])? {
            store.set_file_stage_and_disk(file.id, Stage::OnTape, None)?;
        }
        store.set_storaged_start(request_id, None)?;
        store.set_storaged_end(request_id, None)?;
        store.free_slot(slot_id)
    })
}

/// Check a started slot and rewind it if its retrieval process is gone.
///
/// A slot started on another host is left alone; a slot with no recorded
/// process details gets a grace period before being rewound.
pub fn check_happy(store: &Store, slot: &Slot) -> NlaResult<()> {
    let Some(request_id) = slot.tape_request else {
        return Ok(());
    };
    let request = store
        .request_by_id(request_id)?
        .ok_or(StoreErrorKind::NoSuchRequest(request_id))?;
    let Some(started) = request.storaged_start else {
        debug!("slot {}: not started yet, nothing to correct", slot.id);
        return Ok(());
    };

    if slot.pid.is_none() || slot.host.is_none() {
        if (Utc::now() - started).num_seconds() > UNSTARTED_GRACE_SECS {
            info!("slot {}: no pid or host recorded {UNSTARTED_GRACE_SECS}s after start, rewinding", slot.id);
            return redo_request(store, slot.id);
        }
        return Ok(());
    }
    if slot.host.as_deref() != Some(local_host().as_str()) {
        debug!("slot {}: started on another host, leaving alone", slot.id);
        return Ok(());
    }
    let pid = slot.pid.unwrap_or_default();
    if Path::new(&format!("/proc/{pid}")).exists() {
        debug!("slot {}: pid {pid} still running", slot.id);
        return Ok(());
    }
    info!("slot {}: pid {pid} not running, rewinding request {request_id}", slot.id);
    redo_request(store, slot.id)
}
