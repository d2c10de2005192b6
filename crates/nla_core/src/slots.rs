//! The slot scheduler: keep the retrieval pool at its configured size and
//! load active requests into free slots, first come first served.

use log::{debug, info};

use crate::{
    error::NlaResult,
    model::{TapeRequest, VERIFY_USER},
    store::Store,
};

/// Grow or shrink the pool to `target` slots. Only empty slots are ever
/// deleted, highest id first.
pub fn adjust_slots(store: &Store, target: usize) -> NlaResult<()> {
    let slots = store.slots()?;
    if slots.len() < target {
        for _ in slots.len()..target {
            _ = store.create_slot()?;
        }
        return Ok(());
    }
    if slots.len() > target {
        let mut excess = slots.len() - target;
        for slot in slots.iter().rev() {
            if excess == 0 {
                break;
            }
            if slot.is_free() {
                store.delete_slot(slot.id)?;
                excess -= 1;
            }
        }
    }
    Ok(())
}

/// Fill free slots with active requests.
///
/// Requests are scanned oldest first; a request already seated in a slot is
/// skipped, `_VERIFY` requests are never retrieved (they complete by
/// promotion), and a user at the concurrency cap has to wait. The cap is
/// checked at assignment time only.
pub fn load_slots(store: &Store, max_slots_per_user: u64) -> NlaResult<Vec<(i64, i64)>> {
    let requests = store.active_requests()?;
    let mut next = 0usize;
    let mut assigned = Vec::new();

    for slot in store.slots()? {
        if let Some(request_id) = slot.tape_request {
            let still_active = store
                .request_by_id(request_id)?
                .is_some_and(|request| request.active);
            if still_active {
                continue;
            }
            info!(
                "removing request {request_id} from slot {} as request is no longer active",
                slot.id
            );
            store.free_slot(slot.id)?;
        }

        let Some(request) = next_eligible(store, &requests, &mut next, max_slots_per_user)? else {
            break;
        };
        info!("assigning request {} to slot {}", request.id, slot.id);
        store.set_slot_request(slot.id, Some(request.id))?;
        assigned.push((slot.id, request.id));
        next += 1;
    }
    Ok(assigned)
}

fn next_eligible<'a>(
    store: &Store,
    requests: &'a [TapeRequest],
    next: &mut usize,
    max_slots_per_user: u64,
) -> NlaResult<Option<&'a TapeRequest>> {
    while let Some(request) = requests.get(*next) {
        if store.request_in_any_slot(request.id)? {
            *next += 1;
            continue;
        }
        let user = store
            .quota_by_id(request.quota_id)?
            .map(|quota| quota.user)
            .unwrap_or_default();
        if user == VERIFY_USER {
            *next += 1;
            continue;
        }
        if store.user_slot_count(&user)? >= max_slots_per_user {
            debug!("request {}: user {user} is at the slot cap", request.id);
            *next += 1;
            continue;
        }
        return Ok(Some(request));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewRequest;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn active_request(store: &Store, user: &str, age_days: i64) -> i64 {
        let quota = match store.quota_by_user(user).unwrap() {
            Some(q) => q,
            None => store.add_quota(user, 1 << 40, None, None).unwrap(),
        };
        let request = store
            .create_request(
                &NewRequest { quota_id: quota.id, ..Default::default() },
                Utc::now() - Duration::days(age_days),
            )
            .unwrap();
        store.set_request_active(request.id, true).unwrap();
        request.id
    }

    #[test]
    fn pool_converges_to_target() {
        let store = Store::open_in_memory().unwrap();
        adjust_slots(&store, 5).unwrap();
        assert_eq!(store.slots().unwrap().len(), 5);
        adjust_slots(&store, 5).unwrap();
        assert_eq!(store.slots().unwrap().len(), 5);
        adjust_slots(&store, 2).unwrap();
        assert_eq!(store.slots().unwrap().len(), 2);
    }

    #[test]
    fn shrink_spares_occupied_slots() {
        let store = Store::open_in_memory().unwrap();
        adjust_slots(&store, 3).unwrap();
        let req = active_request(&store, "fred", 1);
        let last = store.slots().unwrap().last().unwrap().id;
        store.set_slot_request(last, Some(req)).unwrap();
        adjust_slots(&store, 1).unwrap();
        let slots = store.slots().unwrap();
        // the occupied slot survives even though it has the highest id
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].tape_request, Some(req));
    }

    #[test]
    fn per_user_cap_is_enforced() {
        let store = Store::open_in_memory().unwrap();
        adjust_slots(&store, 5).unwrap();
        let r1 = active_request(&store, "fred", 3);
        let r2 = active_request(&store, "fred", 2);
        let r3 = active_request(&store, "fred", 1);

        let assigned = load_slots(&store, 2).unwrap();
        let requests: Vec<i64> = assigned.iter().map(|(_, r)| *r).collect();
        // oldest two only; the third stays active but unassigned
        assert_eq!(requests, vec![r1, r2]);
        assert!(!store.request_in_any_slot(r3).unwrap());
        assert!(store.request_by_id(r3).unwrap().unwrap().active);
    }

    #[test]
    fn inactive_requests_are_unseated() {
        let store = Store::open_in_memory().unwrap();
        adjust_slots(&store, 1).unwrap();
        let r1 = active_request(&store, "fred", 2);
        let slot = store.slots().unwrap()[0].id;
        store.set_slot_request(slot, Some(r1)).unwrap();
        store.set_request_active(r1, false).unwrap();
        let r2 = active_request(&store, "ada", 1);

        let assigned = load_slots(&store, 2).unwrap();
        assert_eq!(assigned, vec![(slot, r2)]);
    }

    #[test]
    fn verify_requests_are_never_seated() {
        let store = Store::open_in_memory().unwrap();
        adjust_slots(&store, 1).unwrap();
        let quota = store.ensure_verify_quota().unwrap();
        let request = store
            .create_request(&NewRequest { quota_id: quota.id, ..Default::default() }, Utc::now())
            .unwrap();
        store.set_request_active(request.id, true).unwrap();

        let assigned = load_slots(&store, 2).unwrap();
        assert!(assigned.is_empty());
    }
}
