//! The request manager: resolve request payloads against the current tape
//! inventory and flip requests between active and inactive.

use log::{debug, info};

use crate::{
    error::NlaResult,
    model::{Stage, VERIFY_USER},
    store::Store,
};

/// What one manager run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub examined: usize,
    pub activated: usize,
    pub deactivated: usize,
    /// deactivated because every requested file is already on disk
    pub completed: usize,
}

/// Update every request, oldest first.
///
/// A file-list request whose resolved on-disk file count equals its
/// requested count is complete and goes inactive. `_VERIFY` requests
/// resolve against UNVERIFIED files; user requests resolve against
/// ONTAPE/RESTORING files by explicit list or by substring pattern. The
/// resolved set only grows here — eviction belongs to tidy. Requests with
/// no matches stay registered but inactive, so later ingestion can light
/// them up (forward-looking requests are a feature, not an error).
pub fn update_requests(store: &Store) -> NlaResult<UpdateOutcome> {
    let mut outcome = UpdateOutcome::default();

    for request in store.requests_by_date()? {
        outcome.examined += 1;
        let quota = store.quota_by_id(request.quota_id)?.ok_or_else(|| {
            crate::error::StoreErrorKind::NoQuotaForUser(format!("quota id {}", request.quota_id))
        })?;
        debug!("request {} user {}", request.id, quota.user);

        // completed file-list requests deactivate so they stop occupying slots
        if !request.is_pattern_request() && !request.request_files.is_empty() {
            let done = store
                .count_request_files_in_stages(request.id, &[Stage::OnDisk, Stage::Restored])?;
            if done == request.request_files.len() as u64 {
                debug!("request {}: deactivating as completed", request.id);
                store.set_request_active(request.id, false)?;
                outcome.completed += 1;
                continue;
            }
        }

        if quota.user == VERIFY_USER {
            // internal requests resolve against the unverified backlog
            let present = store.files_by_paths(&request.request_files, &[Stage::Unverified])?;
            if present.is_empty() {
                store.set_request_active(request.id, false)?;
                outcome.deactivated += 1;
            } else {
                store.in_transaction(|store| {
                    store.clear_request_files(request.id)?;
                    let ids: Vec<i64> = present.iter().map(|f| f.id).collect();
                    store.add_files_to_request(request.id, &ids)?;
                    store.set_request_active(request.id, true)
                })?;
                info!(
                    "request {}: active with {} unverified files",
                    request.id,
                    present.len()
                );
                outcome.activated += 1;
            }
            continue;
        }

        let candidates = if !request.request_files.is_empty() {
            store.files_by_paths(&request.request_files, &[Stage::OnTape, Stage::Restoring])?
        } else if let Some(pattern) = request.request_patterns.as_deref().filter(|p| !p.is_empty()) {
            store.files_matching(pattern, &[Stage::OnTape, Stage::Restoring])?
        } else {
            Vec::new()
        };

        if candidates.is_empty() {
            debug!("request {}: inactive, no tape-side matches", request.id);
            store.set_request_active(request.id, false)?;
            outcome.deactivated += 1;
        } else {
            store.in_transaction(|store| {
                let ids: Vec<i64> = candidates.iter().map(|f| f.id).collect();
                store.add_files_to_request(request.id, &ids)?;
                store.set_request_active(request.id, true)
            })?;
            info!(
                "request {}: active with {} tape-side matches",
                request.id,
                candidates.len()
            );
            outcome.activated += 1;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewRequest;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn setup() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn user_request(store: &Store, files: &[&str], pattern: Option<&str>) -> i64 {
        let quota = match store.quota_by_user("fred").unwrap() {
            Some(q) => q,
            None => store.add_quota("fred", 1 << 40, None, None).unwrap(),
        };
        store
            .create_request(
                &NewRequest {
                    quota_id: quota.id,
                    request_files: files.iter().map(|s| s.to_string()).collect(),
                    request_patterns: pattern.map(str::to_string),
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap()
            .id
    }

    #[test]
    fn file_request_activates_on_tape_matches() {
        let store = setup();
        let req = user_request(&store, &["/badc/a/x.dat", "/badc/a/y.dat"], None);
        _ = store.insert_file("/badc/a/x.dat", 10, Stage::OnTape).unwrap();

        let outcome = update_requests(&store).unwrap();
        assert_eq!(outcome.activated, 1);
        let request = store.request_by_id(req).unwrap().unwrap();
        assert!(request.active);
        assert_eq!(store.request_files(req).unwrap().len(), 1);
    }

    #[test]
    fn pattern_request_waits_for_future_ingestion() {
        let store = setup();
        let req = user_request(&store, &[], Some("/a/b/2025/"));

        // at first nothing matches: saved but inactive
        let outcome = update_requests(&store).unwrap();
        assert_eq!(outcome.deactivated, 1);
        assert!(!store.request_by_id(req).unwrap().unwrap().active);

        // ingestion adds a matching file: next run activates the request
        _ = store.insert_file("/a/b/2025/x.dat", 10, Stage::OnTape).unwrap();
        let outcome = update_requests(&store).unwrap();
        assert_eq!(outcome.activated, 1);
        let request = store.request_by_id(req).unwrap().unwrap();
        assert!(request.active);
        assert_eq!(store.request_files(req).unwrap().len(), 1);
    }

    #[test]
    fn completed_file_request_deactivates() {
        let store = setup();
        let req = user_request(&store, &["/badc/a/x.dat"], None);
        let f = store.insert_file("/badc/a/x.dat", 10, Stage::Restored).unwrap();
        store.add_files_to_request(req, &[f]).unwrap();
        store.set_request_active(req, true).unwrap();

        let outcome = update_requests(&store).unwrap();
        assert_eq!(outcome.completed, 1);
        assert!(!store.request_by_id(req).unwrap().unwrap().active);
    }

    #[test]
    fn verify_request_resolves_unverified_files() {
        let store = setup();
        let quota = store.ensure_verify_quota().unwrap();
        let req = store
            .create_request(
                &NewRequest {
                    quota_id: quota.id,
                    request_files: vec!["/badc/a/x.dat".into(), "/badc/a/y.dat".into()],
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap()
            .id;
        _ = store.insert_file("/badc/a/x.dat", 10, Stage::Unverified).unwrap();
        _ = store.insert_file("/badc/a/y.dat", 10, Stage::OnTape).unwrap();

        _ = update_requests(&store).unwrap();
        let request = store.request_by_id(req).unwrap().unwrap();
        assert!(request.active);
        // only the unverified file resolves
        assert_eq!(store.request_files(req).unwrap().len(), 1);
    }

    #[test]
    fn manager_is_idempotent() {
        let store = setup();
        let req = user_request(&store, &["/badc/a/x.dat"], None);
        _ = store.insert_file("/badc/a/x.dat", 10, Stage::OnTape).unwrap();

        _ = update_requests(&store).unwrap();
        let first_files = store.request_files(req).unwrap();
        let first_active = store.request_by_id(req).unwrap().unwrap().active;

        _ = update_requests(&store).unwrap();
        assert_eq!(store.request_files(req).unwrap(), first_files);
        assert_eq!(store.request_by_id(req).unwrap().unwrap().active, first_active);
    }
}
