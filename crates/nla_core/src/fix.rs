//! Reconciliation: a family of idempotent repairs for drift between the
//! database and on-disk reality.
//!
//! Every repair is independently runnable and safe on an arbitrary state
//! snapshot; running any of them to fixed point is a no-op on a healthy
//! system.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use log::{info, warn};

use crate::{
    allocator::recompute_all,
    error::NlaResult,
    ingest::fetch_on_tape_filesets,
    model::{Stage, TapeFile},
    notify::IndexUpdater,
    resolver::PathResolver,
    retrieve::publish_link,
    store::{NewRequest, Store},
    tape::{SpotCache, TapeClient},
};

/// Physical archive-volume marker that should never appear in logical paths.
const ARCHVOL_MARKER: &str = "/datacentre/archvol";

/// Free slots that have no retrieval process recorded, or one targeted slot.
pub fn clear_slots(store: &Store, slot_id: Option<i64>) -> NlaResult<usize> {
    let mut cleared = 0;
    for slot in store.slots()? {
        let matches = match slot_id {
            Some(id) => slot.id == id,
            None => slot.pid.is_none(),
        };
        if matches && !slot.is_free() {
            info!("clearing slot {}", slot.id);
            store.free_slot(slot.id)?;
            cleared += 1;
        }
    }
    Ok(cleared)
}

/// Files stuck RESTORING with nothing at their logical path go back to ONTAPE.
pub fn reset_stuck_restoring(store: &Store) -> NlaResult<usize> {
    let mut reset = 0;
    for file in store.files_in_stages(&[Stage::Restoring])? {
        if !Path::new(&file.logical_path).exists() {
            info!("resetting file {} to ONTAPE", file.logical_path);
            store.set_file_stage_and_disk(file.id, Stage::OnTape, None)?;
            reset += 1;
        }
    }
    Ok(reset)
}

/// Requests stuck with a storaged start and no end are parked inactive.
pub fn reset_stuck_requests(store: &Store) -> NlaResult<usize> {
    let stuck = store.stuck_requests()?;
    for request in &stuck {
        info!("resetting request {} ({})", request.id, request.display_label());
        store.in_transaction(|store| {
            store.set_storaged_start(request.id, None)?;
            store.set_request_active(request.id, false)
        })?;
    }
    Ok(stuck.len())
}

/// Force every request inactive; the next manager run re-activates what
/// still has work.
pub fn deactivate_requests(store: &Store) -> NlaResult<usize> {
    let active = store.active_requests()?;
    for request in &active {
        info!("deactivating request {}", request.id);
        store.set_request_active(request.id, false)?;
    }
    Ok(active.len())
}

/// What one link-repair run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkRepairOutcome {
    /// restore payload found, link re-created, file set RESTORED
    pub relinked: usize,
    /// neither link target nor payload left, file back to ONTAPE
    pub lost: usize,
    /// ONDISK files missing from disk, back to ONTAPE
    pub ondisk_missing: usize,
    /// ONTAPE rows found as real files, re-entering verification
    pub reverify: usize,
    /// dangling links removed for ONTAPE files
    pub dangling_removed: usize,
}

/// Repair the symlink layer around restores and evictions.
pub fn repair_links(store: &Store, resolver: &PathResolver) -> NlaResult<LinkRepairOutcome> {
    let mut outcome = LinkRepairOutcome::default();

    for file in store.files_in_stages(&[Stage::Restoring, Stage::Restored])? {
        let logical = Path::new(&file.logical_path);
        if logical.exists() {
            continue;
        }
        if let Some(restore_path) = reconstruct_restore_path(store, resolver, &file)? {
            if restore_path.exists() {
                info!("linking {} to {}", file.logical_path, restore_path.display());
                match publish_link(&file.logical_path, &restore_path.to_string_lossy()) {
                    Ok(()) => {
                        store.set_file_stage_and_disk(file.id, Stage::Restored, file.restore_disk)?;
                        outcome.relinked += 1;
                    }
                    Err(err) => warn!("could not link {}: {err}", file.logical_path),
                }
                continue;
            }
        }
        // nothing left of the restored copy
        info!("restore of {} is gone, back to ONTAPE", file.logical_path);
        if fs::symlink_metadata(logical).is_ok() {
            if let Err(err) = fs::remove_file(logical) {
                warn!("could not remove dangling link {}: {err}", file.logical_path);
            }
        }
        store.set_file_stage_and_disk(file.id, Stage::OnTape, None)?;
        outcome.lost += 1;
    }

    // missing on disk means the cached copy is gone, not that the tape copy
    // is untrusted
    for file in store.files_in_stages(&[Stage::OnDisk])? {
        if !Path::new(&file.logical_path).exists() {
            store.set_file_stage_and_disk(file.id, Stage::OnTape, None)?;
            outcome.ondisk_missing += 1;
        }
    }

    for file in store.files_in_stages(&[Stage::OnTape])? {
        let logical = Path::new(&file.logical_path);
        match fs::symlink_metadata(logical) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if !logical.exists() {
                    info!("removing dangling link at {}", file.logical_path);
                    if let Err(err) = fs::remove_file(logical) {
                        warn!("could not remove {}: {err}", file.logical_path);
                    } else {
                        outcome.dangling_removed += 1;
                    }
                }
            }
            Ok(_) => {
                info!("{} present as a real file, re-entering verification", file.logical_path);
                store.set_file_stage_and_disk(file.id, Stage::Unverified, None)?;
                outcome.reverify += 1;
            }
            Err(_) => {}
        }
    }

    Ok(outcome)
}

/// Where a file's restored payload would live on its restore disk.
fn reconstruct_restore_path(
    store: &Store,
    resolver: &PathResolver,
    file: &TapeFile,
) -> NlaResult<Option<PathBuf>> {
    let Some(disk_id) = file.restore_disk else {
        return Ok(None);
    };
    let Some(disk) = store.disk_by_id(disk_id)? else {
        return Ok(None);
    };
    let (prefix, spot_name) = match resolver.resolve_spot(&file.logical_path) {
        Ok(found) => found,
        Err(_) => return Ok(None),
    };
    let remainder = &file.logical_path[prefix.len()..];
    Ok(Some(PathBuf::from(format!(
        "{}/archive/{spot_name}{remainder}",
        disk.mountpoint
    ))))
}

/// Delete payload files on the restore disks whose logical path the
/// database says is ONTAPE and which have no link pointing at them.
pub fn clean_orphans(store: &Store, resolver: &PathResolver) -> NlaResult<usize> {
    let mut removed = 0;
    for disk in store.disks()? {
        let archive_root = Path::new(&disk.mountpoint).join("archive");
        let spots = match fs::read_dir(&archive_root) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for spot_dir in spots.filter_map(Result::ok) {
            let spot_name = spot_dir.file_name().to_string_lossy().into_owned();
            let Some(logical_root) = resolver.logical_root(&spot_name) else {
                warn!("restore area holds unknown spot {spot_name}");
                continue;
            };
            for entry in walkdir::WalkDir::new(spot_dir.path())
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                let Ok(remainder) = entry.path().strip_prefix(spot_dir.path()) else {
                    continue;
                };
                let logical = Path::new(logical_root).join(remainder);
                let known = store
                    .file_by_path(&logical.to_string_lossy())?
                    .is_some_and(|f| f.stage == Stage::OnTape);
                if known && !logical.exists() {
                    info!("removing orphaned payload {}", entry.path().display());
                    if let Err(err) = fs::remove_file(entry.path()) {
                        warn!("could not remove {}: {err}", entry.path().display());
                    } else {
                        removed += 1;
                    }
                }
            }
        }
    }
    Ok(removed)
}

/// Evict RESTORED/RESTORING files that no request references, directly or
/// by pattern.
pub fn delete_not_in_request(store: &Store, index: &dyn IndexUpdater) -> NlaResult<usize> {
    let requests = store.requests_by_date()?;
    let mut removed_paths = Vec::new();

    for file in store.files_in_stages(&[Stage::Restored, Stage::Restoring])? {
        if store.file_in_any_request(file.id)? {
            continue;
        }
        let referenced = requests.iter().any(|request| {
            request.request_files.iter().any(|p| p == &file.logical_path)
                || request
                    .request_patterns
                    .as_deref()
                    .is_some_and(|p| !p.is_empty() && file.logical_path.contains(p))
        });
        if referenced {
            continue;
        }
        info!("{} not in any request, evicting", file.logical_path);
        let logical = Path::new(&file.logical_path);
        if let Ok(payload) = fs::read_link(logical) {
            if let Err(err) = fs::remove_file(&payload) {
                warn!("could not remove payload {}: {err}", payload.display());
            }
        }
        if fs::symlink_metadata(logical).is_ok() {
            if let Err(err) = fs::remove_file(logical) {
                warn!("could not remove {}: {err}", file.logical_path);
            }
        }
        store.set_file_stage_and_disk(file.id, Stage::OnTape, None)?;
        removed_paths.push(file.logical_path);
    }

    if !removed_paths.is_empty() {
        index.set_locations(&removed_paths, false);
        recompute_all(store)?;
    }
    Ok(removed_paths.len())
}

/// Consolidate rows sharing one logical path down to a single row.
pub fn remove_duplicates(store: &Store) -> NlaResult<usize> {
    let mut removed = 0;
    for path in store.duplicate_paths()? {
        let rows = store.files_with_path(&path)?;
        let Some(first) = rows.first() else {
            continue;
        };

        let all_equal = rows.iter().all(|f| f.stage == first.stage);
        let any_restored = rows.iter().any(|f| f.stage == Stage::Restored);
        let tape_unverified_mix = rows.iter().any(|f| f.stage == Stage::OnTape)
            && rows.iter().any(|f| f.stage == Stage::Unverified);

        let keep = if all_equal {
            first.clone()
        } else if any_restored {
            // keep one row; RESTORED only if the link actually resolves
            let keeper = first.clone();
            let stage = if Path::new(&path).exists() {
                Stage::Restored
            } else {
                Stage::OnTape
            };
            let disk = rows.iter().find_map(|f| f.restore_disk);
            let disk = if stage == Stage::Restored { disk } else { None };
            store.set_file_stage_and_disk(keeper.id, stage, disk)?;
            keeper
        } else if tape_unverified_mix {
            // the tape copy is authoritative over an unverified re-ingest
            rows.iter()
                .find(|f| f.stage == Stage::OnTape)
                .cloned()
                .unwrap_or_else(|| first.clone())
        } else {
            first.clone()
        };

        for row in &rows {
            if row.id != keep.id {
                store.delete_file(row.id)?;
                removed += 1;
            }
        }
        info!("consolidated {} duplicate row(s) for {path}", rows.len() - 1);
    }
    Ok(removed)
}

/// Register files that are on tape but unknown to the system.
///
/// The primary-on-tape endpoint lists the filesets whose primary copy is
/// tape; every sufficiently large file in their spots that the store does
/// not know is inserted at ONTAPE with the size `sd_ls` reports.
pub fn readd_missing_on_tape(
    store: &Store,
    resolver: &PathResolver,
    client: &TapeClient,
    on_tape_url: &str,
    min_file_size: u64,
) -> NlaResult<usize> {
    let listing = fetch_on_tape_filesets(on_tape_url)?;
    let mut cache = SpotCache::new(client);
    let mut added = 0;

    for fileset in listing {
        let (_, spot_name) = match resolver.resolve_spot(&fileset) {
            Ok(found) => found,
            Err(err) => {
                warn!("no spot for primary-on-tape fileset {fileset}: {err}");
                continue;
            }
        };
        let spot_name = spot_name.to_string();
        let Some(logical_root) = resolver.logical_root(&spot_name).map(str::to_string) else {
            continue;
        };
        let Some(entries) = cache.entries(&spot_name)? else {
            warn!("spot {spot_name} unknown to the tape system");
            continue;
        };
        let tape_prefix = format!("/archive/{spot_name}");
        for entry in entries.values() {
            if entry.size <= min_file_size {
                continue;
            }
            let Some(remainder) = entry.path.strip_prefix(&tape_prefix) else {
                continue;
            };
            let logical = format!("{logical_root}{remainder}");
            match store.file_by_path(&logical)? {
                None => {
                    info!("re-adding {logical} at ONTAPE ({} bytes)", entry.size);
                    _ = store.insert_file(&logical, entry.size, Stage::OnTape)?;
                    added += 1;
                }
                // a deleted row whose file is demonstrably on tape comes back
                Some(file) if file.stage == Stage::Deleted => {
                    info!("reviving deleted row {logical}: present on tape");
                    store.set_file_stage_and_disk(file.id, Stage::OnTape, None)?;
                    added += 1;
                }
                Some(_) => {}
            }
        }
    }
    Ok(added)
}

/// Re-map UNVERIFIED files registered under a physical archive-volume path.
///
/// `/datacentre/archvol/panNN/archive/spot-…/rest` becomes
/// `<logical root of spot>/rest`, but only when the re-mapped target
/// demonstrably exists on disk or in the spot's tape listing.
pub fn remap_misregistered(
    store: &Store,
    resolver: &PathResolver,
    client: &TapeClient,
) -> NlaResult<usize> {
    let mut cache = SpotCache::new(client);
    let mut remapped = 0;

    for file in store.files_in_stages(&[Stage::Unverified])? {
        if !file.logical_path.contains(ARCHVOL_MARKER) {
            continue;
        }
        let mut parts = file.logical_path.split('/');
        let Some(spot_name) = parts.find(|part| part.starts_with("spot")) else {
            warn!("no spot segment in mis-registered path {}", file.logical_path);
            continue;
        };
        let spot_name = spot_name.to_string();
        let remainder: String = parts.collect::<Vec<_>>().join("/");
        let Some(logical_root) = resolver.logical_root(&spot_name) else {
            warn!("unknown spot {spot_name} in {}", file.logical_path);
            continue;
        };
        let target = format!("{logical_root}/{remainder}");

        let on_disk = Path::new(&target).exists();
        let on_tape = match cache.entries(&spot_name)? {
            Some(entries) => {
                let basename = target.rsplit('/').next().unwrap_or(&target);
                entries.contains_key(basename)
            }
            None => false,
        };
        if on_disk || on_tape {
            info!("re-mapping {} to {target}", file.logical_path);
            store.set_file_logical_path(file.id, &target)?;
            remapped += 1;
        }
    }
    Ok(remapped)
}

/// Sweep ONDISK files that no request references into a synthetic `_VERIFY`
/// request with a one-day retention, so tidy can move them to tape.
pub fn request_on_disk_files(store: &Store) -> NlaResult<Option<i64>> {
    let mut orphaned = Vec::new();
    for file in store.files_in_stages(&[Stage::OnDisk])? {
        if !store.file_in_any_request(file.id)? {
            orphaned.push(file.logical_path);
        }
    }
    if orphaned.is_empty() {
        return Ok(None);
    }

    let quota = store.ensure_verify_quota()?;
    let now = Utc::now();
    let request = store.create_request(
        &NewRequest {
            label: Some("FROM FIX PROBLEMS".to_string()),
            quota_id: quota.id,
            retention: Some(now + Duration::days(1)),
            request_files: orphaned,
            mark_complete_at: Some(now),
            ..Default::default()
        },
        now,
    )?;
    info!(
        "created request {} for {} stranded ONDISK file(s)",
        request.id,
        request.request_files.len()
    );
    Ok(Some(request.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopIndexUpdater;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn resolver_for(tmp: &TempDir) -> PathResolver {
        let download_conf = format!("spot-0001-cira {}\n", tmp.path().join("badc/cira").display());
        let spotlist = "/datacentre/archvol/pan52/archive/cira spot-0001-cira\n";
        PathResolver::from_tables(&download_conf, spotlist).unwrap()
    }

    #[test]
    fn clear_slots_frees_processless_and_targeted_slots() {
        let store = Store::open_in_memory().unwrap();
        let quota = store.add_quota("fred", 1 << 40, None, None).unwrap();
        let mut slot_ids = Vec::new();
        for _ in 0..3 {
            let req = store
                .create_request(&NewRequest { quota_id: quota.id, ..Default::default() }, Utc::now())
                .unwrap();
            let slot = store.create_slot().unwrap();
            store.set_slot_request(slot, Some(req.id)).unwrap();
            slot_ids.push(slot);
        }
        // slot 0 has a live process and must survive the blanket clear
        store.set_slot_process(slot_ids[0], 4711, "host1", "/restore_1").unwrap();

        assert_eq!(clear_slots(&store, None).unwrap(), 2);
        assert!(!store.slot_by_id(slot_ids[0]).unwrap().unwrap().is_free());
        assert!(store.slot_by_id(slot_ids[1]).unwrap().unwrap().is_free());

        // a targeted clear takes out the running slot too
        assert_eq!(clear_slots(&store, Some(slot_ids[0])).unwrap(), 1);
        assert!(store.slot_by_id(slot_ids[0]).unwrap().unwrap().is_free());
    }

    #[test]
    fn stuck_restoring_files_reset_to_ontape() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_file("/nonexistent/badc/x.dat", 10, Stage::Restoring)
            .unwrap();
        assert_eq!(reset_stuck_restoring(&store).unwrap(), 1);
        assert_eq!(store.file_by_id(id).unwrap().unwrap().stage, Stage::OnTape);
        // idempotent
        assert_eq!(reset_stuck_restoring(&store).unwrap(), 0);
    }

    #[test]
    fn stuck_requests_are_parked() {
        let store = Store::open_in_memory().unwrap();
        let quota = store.add_quota("fred", 1 << 40, None, None).unwrap();
        let req = store
            .create_request(&NewRequest { quota_id: quota.id, ..Default::default() }, Utc::now())
            .unwrap();
        store.set_request_active(req.id, true).unwrap();
        store.set_storaged_start(req.id, Some(Utc::now())).unwrap();

        assert_eq!(reset_stuck_requests(&store).unwrap(), 1);
        let request = store.request_by_id(req.id).unwrap().unwrap();
        assert!(!request.active);
        assert!(request.storaged_start.is_none());
        assert_eq!(reset_stuck_requests(&store).unwrap(), 0);
    }

    #[test]
    fn repair_links_recreates_and_demotes() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver_for(&tmp);
        let store = Store::open_in_memory().unwrap();
        let disk = store
            .add_disk(tmp.path().join("restore_1").to_str().unwrap(), 1 << 30)
            .unwrap();

        // restored payload exists, link is missing → relink + RESTORED
        let payload = tmp.path().join("restore_1/archive/spot-0001-cira/data/a.dat");
        fs::create_dir_all(payload.parent().unwrap()).unwrap();
        fs::write(&payload, b"data").unwrap();
        let logical_a = tmp.path().join("badc/cira/data/a.dat");
        fs::create_dir_all(logical_a.parent().unwrap()).unwrap();
        let a = store
            .insert_file(logical_a.to_str().unwrap(), 4, Stage::Restoring)
            .unwrap();
        store.set_file_stage_and_disk(a, Stage::Restoring, Some(disk.id)).unwrap();

        // nothing left at all → ONTAPE
        let logical_b = tmp.path().join("badc/cira/data/b.dat");
        let b = store
            .insert_file(logical_b.to_str().unwrap(), 4, Stage::Restored)
            .unwrap();
        store.set_file_stage_and_disk(b, Stage::Restored, Some(disk.id)).unwrap();

        // ONTAPE row that is actually a real file → UNVERIFIED
        let logical_c = tmp.path().join("badc/cira/data/c.dat");
        fs::write(&logical_c, b"back").unwrap();
        let c = store.insert_file(logical_c.to_str().unwrap(), 4, Stage::OnTape).unwrap();

        // ONTAPE row with a dangling link → link removed
        let logical_d = tmp.path().join("badc/cira/data/d.dat");
        std::os::unix::fs::symlink("/gone/away", &logical_d).unwrap();
        _ = store.insert_file(logical_d.to_str().unwrap(), 4, Stage::OnTape).unwrap();

        let outcome = repair_links(&store, &resolver).unwrap();
        assert_eq!(outcome.relinked, 1);
        assert_eq!(outcome.lost, 1);
        assert_eq!(outcome.reverify, 1);
        assert_eq!(outcome.dangling_removed, 1);

        assert_eq!(store.file_by_id(a).unwrap().unwrap().stage, Stage::Restored);
        assert!(logical_a.exists());
        let lost = store.file_by_id(b).unwrap().unwrap();
        assert_eq!(lost.stage, Stage::OnTape);
        assert_eq!(lost.restore_disk, None);
        assert_eq!(store.file_by_id(c).unwrap().unwrap().stage, Stage::Unverified);
        assert!(fs::symlink_metadata(&logical_d).is_err());

        // second run is a no-op
        let outcome = repair_links(&store, &resolver).unwrap();
        assert_eq!(outcome, LinkRepairOutcome::default());
    }

    #[test]
    fn misregistered_paths_are_remapped() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver_for(&tmp);
        let store = Store::open_in_memory().unwrap();
        // the tape system is unreachable here; the on-disk check must carry
        let client = TapeClient {
            sd_get: "/bin/false".into(),
            sd_ls: "/bin/false".into(),
            sd_host: "sd-test".into(),
            test_mode: false,
        };

        let target = tmp.path().join("badc/cira/data/x.dat");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"data").unwrap();
        let bad = store
            .insert_file(
                "/datacentre/archvol/pan52/archive/spot-0001-cira/data/x.dat",
                4,
                Stage::Unverified,
            )
            .unwrap();
        // a mis-registered path whose target is nowhere stays as it is
        let hopeless = store
            .insert_file(
                "/datacentre/archvol/pan52/archive/spot-0001-cira/data/gone.dat",
                4,
                Stage::Unverified,
            )
            .unwrap();

        assert_eq!(remap_misregistered(&store, &resolver, &client).unwrap(), 1);
        assert_eq!(
            store.file_by_id(bad).unwrap().unwrap().logical_path,
            target.to_string_lossy()
        );
        assert!(store
            .file_by_id(hopeless)
            .unwrap()
            .unwrap()
            .logical_path
            .contains(ARCHVOL_MARKER));
    }

    #[test]
    fn orphaned_payloads_are_cleaned() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver_for(&tmp);
        let store = Store::open_in_memory().unwrap();
        _ = store
            .add_disk(tmp.path().join("restore_1").to_str().unwrap(), 1 << 30)
            .unwrap();

        let payload = tmp.path().join("restore_1/archive/spot-0001-cira/data/o.dat");
        fs::create_dir_all(payload.parent().unwrap()).unwrap();
        fs::write(&payload, b"data").unwrap();
        let logical = tmp.path().join("badc/cira/data/o.dat");
        _ = store.insert_file(logical.to_str().unwrap(), 4, Stage::OnTape).unwrap();

        assert_eq!(clean_orphans(&store, &resolver).unwrap(), 1);
        assert!(!payload.exists());
        assert_eq!(clean_orphans(&store, &resolver).unwrap(), 0);
    }

    #[test]
    fn duplicates_consolidate_to_one_row() {
        let store = Store::open_in_memory().unwrap();
        // all equal: keep one
        _ = store.insert_file("/badc/a.dat", 1, Stage::OnTape).unwrap();
        _ = store.insert_file("/badc/a.dat", 1, Stage::OnTape).unwrap();
        // tape + unverified: the tape row wins
        _ = store.insert_file("/badc/b.dat", 1, Stage::Unverified).unwrap();
        let b_tape = store.insert_file("/badc/b.dat", 1, Stage::OnTape).unwrap();
        // restored without a resolving link: keeper lands on ONTAPE
        _ = store.insert_file("/badc/c.dat", 1, Stage::Restored).unwrap();
        _ = store.insert_file("/badc/c.dat", 1, Stage::OnTape).unwrap();

        let removed = remove_duplicates(&store).unwrap();
        assert_eq!(removed, 3);
        assert!(store.duplicate_paths().unwrap().is_empty());
        let b = store.file_by_path("/badc/b.dat").unwrap().unwrap();
        assert_eq!((b.id, b.stage), (b_tape, Stage::OnTape));
        assert_eq!(store.file_by_path("/badc/c.dat").unwrap().unwrap().stage, Stage::OnTape);
        // idempotent
        assert_eq!(remove_duplicates(&store).unwrap(), 0);
    }

    #[test]
    fn unreferenced_restores_are_evicted() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let disk = store
            .add_disk(tmp.path().join("restore_1").to_str().unwrap(), 1 << 30)
            .unwrap();
        let quota = store.add_quota("fred", 1 << 40, None, None).unwrap();

        let payload = tmp.path().join("restore_1/orphan.dat");
        fs::write(&payload, b"data").unwrap();
        let logical = tmp.path().join("badc/orphan.dat");
        fs::create_dir_all(logical.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(&payload, &logical).unwrap();
        let orphan = store
            .insert_file(logical.to_str().unwrap(), 4, Stage::Restored)
            .unwrap();
        store.set_file_stage_and_disk(orphan, Stage::Restored, Some(disk.id)).unwrap();

        // a second restored file is covered by a pattern request and survives
        let wanted_logical = tmp.path().join("badc/wanted.dat");
        let wanted = store
            .insert_file(wanted_logical.to_str().unwrap(), 4, Stage::Restored)
            .unwrap();
        store.set_file_stage_and_disk(wanted, Stage::Restored, Some(disk.id)).unwrap();
        _ = store
            .create_request(
                &NewRequest {
                    quota_id: quota.id,
                    request_patterns: Some("wanted".to_string()),
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap();

        assert_eq!(delete_not_in_request(&store, &NoopIndexUpdater).unwrap(), 1);
        assert_eq!(store.file_by_id(orphan).unwrap().unwrap().stage, Stage::OnTape);
        assert!(fs::symlink_metadata(&logical).is_err());
        assert!(!payload.exists());
        assert_eq!(store.file_by_id(wanted).unwrap().unwrap().stage, Stage::Restored);
    }

    #[test]
    fn stranded_ondisk_files_get_a_sweep_request() {
        let store = Store::open_in_memory().unwrap();
        _ = store.insert_file("/badc/x.dat", 10, Stage::OnDisk).unwrap();
        let request_id = request_on_disk_files(&store).unwrap().unwrap();
        let request = store.request_by_id(request_id).unwrap().unwrap();
        assert_eq!(request.request_files, vec!["/badc/x.dat"]);
        assert_eq!(request.label.as_deref(), Some("FROM FIX PROBLEMS"));
        assert!(request.retention > Utc::now());
        // once the manager has resolved the request, the file counts as
        // referenced and a rerun finds nothing to sweep
        let file = store.file_by_path("/badc/x.dat").unwrap().unwrap();
        store.add_files_to_request(request_id, &[file.id]).unwrap();
        assert_eq!(request_on_disk_files(&store).unwrap(), None);
    }
}
