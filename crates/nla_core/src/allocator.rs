//! Restore disk selection and usage accounting.

use log::{info, warn};

use crate::{
    error::NlaResult,
    model::{RestoreDisk, Stage},
    store::Store,
};

/// Pick the restore disk for a request: the first disk (in id order) whose
/// free space exceeds the request's residual tape-resident size.
///
/// Returns `None` when no disk has enough room; the caller leaves the
/// request active and retries on a later tick.
pub fn choose_disk(store: &Store, request_id: i64) -> NlaResult<Option<RestoreDisk>> {
    let residual = store.request_residual_bytes(request_id)?;
    for disk in store.disks()? {
        if disk.free_bytes() > residual {
            return Ok(Some(disk));
        }
    }
    warn!("no restore disk has {residual} bytes free for request {request_id}");
    Ok(None)
}

/// Recompute a disk's used bytes from the RESTORED files it holds.
///
/// Idempotent; called after restores, evictions and on recovery.
pub fn recompute_used(store: &Store, disk_id: i64) -> NlaResult<u64> {
    let used = store.restored_bytes_on_disk(disk_id)?;
    store.set_disk_used(disk_id, used)?;
    Ok(used)
}

/// Recompute every disk.
pub fn recompute_all(store: &Store) -> NlaResult<()> {
    for disk in store.disks()? {
        let used = recompute_used(store, disk.id)?;
        info!("restore disk {}: {used} bytes used", disk.mountpoint);
    }
    Ok(())
}

/// Give RESTORED files without a restore disk the first disk, then bring
/// every disk's accounting up to date. Repairs rows from before restore
/// disks were tracked per file.
pub fn assign_missing_restore_disk(store: &Store) -> NlaResult<usize> {
    let disks = store.disks()?;
    let Some(first) = disks.first() else {
        return Ok(0);
    };
    let mut assigned = 0;
    for file in store.files_in_stages(&[Stage::Restored])? {
        if file.restore_disk.is_none() {
            store.set_file_stage_and_disk(file.id, Stage::Restored, Some(first.id))?;
            assigned += 1;
        }
    }
    recompute_all(store)?;
    Ok(assigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewRequest;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn store_with_request(files: &[(&str, u64, Stage)]) -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let quota = store.add_quota("fred", 1 << 40, None, None).unwrap();
        let req = store
            .create_request(&NewRequest { quota_id: quota.id, ..Default::default() }, Utc::now())
            .unwrap();
        for (path, size, stage) in files {
            let id = store.insert_file(path, *size, *stage).unwrap();
            store.add_files_to_request(req.id, &[id]).unwrap();
        }
        (store, req.id)
    }

    #[test]
    fn first_disk_with_enough_space_wins() {
        let (store, req) = store_with_request(&[
            ("/badc/a/x.dat", 10 << 30, Stage::OnTape),
            ("/badc/a/y.dat", 10 << 30, Stage::OnTape),
            // already restored files don't count towards the residual
            ("/badc/a/z.dat", 100 << 30, Stage::Restored),
        ]);
        let small = store.add_disk("/restore_0", 10 << 30).unwrap();
        let big = store.add_disk("/restore_1", 100 << 30).unwrap();
        let chosen = choose_disk(&store, req).unwrap().unwrap();
        assert_eq!(chosen.id, big.id);
        assert_ne!(chosen.id, small.id);
    }

    #[test]
    fn no_space_returns_none() {
        let (store, req) = store_with_request(&[("/badc/a/x.dat", 10 << 30, Stage::OnTape)]);
        _ = store.add_disk("/restore_0", 1 << 30).unwrap();
        assert!(choose_disk(&store, req).unwrap().is_none());
    }

    #[test]
    fn free_must_exceed_residual_strictly() {
        let (store, req) = store_with_request(&[("/badc/a/x.dat", 1 << 30, Stage::OnTape)]);
        _ = store.add_disk("/restore_0", 1 << 30).unwrap();
        assert!(choose_disk(&store, req).unwrap().is_none());
    }

    #[test]
    fn recompute_used_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let disk = store.add_disk("/restore_0", 100 << 30).unwrap();
        let f1 = store.insert_file("/badc/a/x.dat", 7, Stage::Restored).unwrap();
        store.set_file_stage_and_disk(f1, Stage::Restored, Some(disk.id)).unwrap();
        let f2 = store.insert_file("/badc/a/y.dat", 5, Stage::Restoring).unwrap();
        store.set_file_stage_and_disk(f2, Stage::Restoring, Some(disk.id)).unwrap();
        assert_eq!(recompute_used(&store, disk.id).unwrap(), 7);
        assert_eq!(recompute_used(&store, disk.id).unwrap(), 7);
        assert_eq!(store.disk_by_id(disk.id).unwrap().unwrap().used_bytes, 7);
    }

    #[test]
    fn missing_restore_disks_are_backfilled() {
        let store = Store::open_in_memory().unwrap();
        let disk = store.add_disk("/restore_0", 100 << 30).unwrap();
        let f1 = store.insert_file("/badc/a/x.dat", 7, Stage::Restored).unwrap();
        assert_eq!(assign_missing_restore_disk(&store).unwrap(), 1);
        let file = store.file_by_id(f1).unwrap().unwrap();
        assert_eq!(file.restore_disk, Some(disk.id));
        assert_eq!(store.disk_by_id(disk.id).unwrap().unwrap().used_bytes, 7);
    }
}
