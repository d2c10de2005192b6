//! Model operations behind the HTTP control plane.
//!
//! The HTTP layer itself lives elsewhere and stays thin: every endpoint maps
//! onto one function here, with serde-ready request and response types. The
//! same operations back the operator CLI.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    error::{NlaResult, RequestErrorKind, StoreErrorKind},
    model::{Quota, Stage, TapeRequest, ALL_STAGES},
    resolver::PathResolver,
    store::{NewRequest, Store},
};

/// One row of `GET /api/v1/requests`.
#[derive(Clone, Debug, Serialize)]
pub struct RequestSummary {
    pub id: i64,
    pub quota: String,
    pub retention: DateTime<Utc>,
    pub request_date: DateTime<Utc>,
    pub label: Option<String>,
}

/// `GET /api/v1/requests/<id>`.
#[derive(Clone, Debug, Serialize)]
pub struct RequestDetail {
    pub id: i64,
    pub quota: String,
    pub retention: DateTime<Utc>,
    pub request_date: DateTime<Utc>,
    pub request_patterns: Option<String>,
    pub notify_on_first_file: Option<String>,
    pub notify_on_last_file: Option<String>,
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storaged_request_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storaged_request_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_files_on_disk: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_files_on_disk: Option<DateTime<Utc>>,
    pub files: Vec<String>,
}

/// Body of `POST /api/v1/requests`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubmitRequest {
    pub quota: String,
    pub patterns: Option<String>,
    pub files: Option<Vec<String>>,
    /// `YYYY-MM-DD`; defaults to five days from submission
    pub retention: Option<String>,
    pub label: Option<String>,
    pub notify_on_first_file: Option<String>,
    pub notify_on_last_file: Option<String>,
}

/// Body of `PUT /api/v1/requests/<id>`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateRequest {
    pub quota: String,
    pub label: Option<String>,
    /// `YYYY-MM-DD`
    pub retention: Option<String>,
    pub notify_on_first_file: Option<String>,
    pub notify_on_last_file: Option<String>,
}

/// `GET /api/v1/quota/<user>`.
#[derive(Clone, Debug, Serialize)]
pub struct QuotaDetail {
    pub id: i64,
    pub user: String,
    pub size: u64,
    pub used: u64,
    pub email: Option<String>,
    pub notes: Option<String>,
    pub requests: Vec<RequestSummary>,
}

/// `GET /api/v1/files`.
#[derive(Clone, Debug, Serialize)]
pub struct FileQuery {
    pub count: usize,
    pub files: Vec<FileEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(rename = "spot-name", skip_serializing_if = "Option::is_none")]
    pub spot_name: Option<String>,
    pub size: u64,
    pub verified: Option<DateTime<Utc>>,
    pub stage: char,
}

/// Per-stage archive totals (the operator `status` view).
#[derive(Clone, Debug, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub letter: char,
    pub count: u64,
    pub bytes: u64,
}

/// All requests, for the request listing endpoint.
pub fn list_requests(store: &Store) -> NlaResult<Vec<RequestSummary>> {
    let mut summaries = Vec::new();
    for request in store.requests_by_date()? {
        summaries.push(summary(store, &request)?);
    }
    Ok(summaries)
}

fn summary(store: &Store, request: &TapeRequest) -> NlaResult<RequestSummary> {
    let user = store
        .quota_by_id(request.quota_id)?
        .map(|quota| quota.user)
        .unwrap_or_default();
    Ok(RequestSummary {
        id: request.id,
        quota: user,
        retention: request.retention,
        request_date: request.request_date,
        label: Some(request.display_label().to_string()),
    })
}

/// One request with its file listing, by priority: the resolved set, else
/// the requested paths, else the pattern expansion.
pub fn get_request(store: &Store, id: i64) -> NlaResult<Option<RequestDetail>> {
    let Some(request) = store.request_by_id(id)? else {
        return Ok(None);
    };
    let user = store
        .quota_by_id(request.quota_id)?
        .map(|quota| quota.user)
        .unwrap_or_default();

    let resolved: Vec<String> = store
        .request_files(id)?
        .into_iter()
        .map(|f| f.logical_path)
        .collect();
    let files = if !resolved.is_empty() {
        resolved
    } else if !request.request_files.is_empty() {
        request.request_files.clone()
    } else if let Some(pattern) = request.request_patterns.as_deref().filter(|p| !p.is_empty()) {
        store
            .files_matching(pattern, &ALL_STAGES)?
            .into_iter()
            .map(|f| f.logical_path)
            .collect()
    } else {
        Vec::new()
    };

    Ok(Some(RequestDetail {
        id: request.id,
        quota: user,
        retention: request.retention,
        request_date: request.request_date,
        request_patterns: request.request_patterns.clone(),
        notify_on_first_file: request.notify_first.clone(),
        notify_on_last_file: request.notify_last.clone(),
        label: request.label.clone(),
        storaged_request_start: request.storaged_start,
        storaged_request_end: request.storaged_end,
        first_files_on_disk: request.first_on_disk,
        last_files_on_disk: request.last_on_disk,
        files,
    }))
}

/// Submit a request, enforcing the user's quota. Returns the new request id.
pub fn submit_request(store: &Store, submit: &SubmitRequest, now: DateTime<Utc>) -> NlaResult<i64> {
    let quota = store
        .quota_by_user(&submit.quota)?
        .ok_or_else(|| RequestErrorKind::NoQuotaForUser(submit.quota.clone()))?;

    let files = submit.files.clone().unwrap_or_default();
    let pattern = submit
        .patterns
        .clone()
        .filter(|p| !p.is_empty() && files.is_empty());
    if files.is_empty() && pattern.is_none() {
        return Err(RequestErrorKind::EmptyRequest.into());
    }

    // what would this request pin on disk right now?
    let matched = if !files.is_empty() {
        store.files_by_paths(&files, &ALL_STAGES)?
    } else {
        store.files_matching(pattern.as_deref().unwrap_or_default(), &ALL_STAGES)?
    };
    let total_size: u64 = matched.iter().map(|f| f.size).sum();
    if store.quota_used(quota.id, now)? + total_size > quota.size {
        return Err(RequestErrorKind::QuotaExceeded.into());
    }

    let retention = submit.retention.as_deref().map(parse_retention).transpose()?;
    let label = submit.label.clone().or_else(|| {
        files.first().cloned().or_else(|| pattern.clone())
    });
    let request = store.create_request(
        &NewRequest {
            label,
            quota_id: quota.id,
            retention,
            request_files: files,
            request_patterns: pattern,
            notify_first: resolve_notify(submit.notify_on_first_file.as_deref(), &quota),
            notify_last: resolve_notify(submit.notify_on_last_file.as_deref(), &quota),
            mark_complete_at: None,
        },
        now,
    )?;
    Ok(request.id)
}

/// Update a request's label, retention or notification addresses.
pub fn update_request(store: &Store, id: i64, update: &UpdateRequest) -> NlaResult<()> {
    if store.request_by_id(id)?.is_none() {
        return Err(StoreErrorKind::NoSuchRequest(id).into());
    }
    let quota = store
        .quota_by_user(&update.quota)?
        .ok_or_else(|| RequestErrorKind::NoQuotaForUser(update.quota.clone()))?;

    let retention = update.retention.as_deref().map(parse_retention).transpose()?;
    store.update_request_fields(
        id,
        update.label.as_deref(),
        retention,
        resolve_notify(update.notify_on_first_file.as_deref(), &quota).as_deref(),
        resolve_notify(update.notify_on_last_file.as_deref(), &quota).as_deref(),
    )
}

/// An empty notification address falls back to the quota owner's email.
fn resolve_notify(given: Option<&str>, quota: &Quota) -> Option<String> {
    match given {
        None => None,
        Some("") => quota.email.clone(),
        Some(address) => Some(address.to_string()),
    }
}

fn parse_retention(s: &str) -> NlaResult<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| RequestErrorKind::InvalidRetention(s.to_string()))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

/// A user's quota, usage and requests.
pub fn quota_detail(store: &Store, user: &str, now: DateTime<Utc>) -> NlaResult<Option<QuotaDetail>> {
    let Some(quota) = store.quota_by_user(user)? else {
        return Ok(None);
    };
    let mut requests = Vec::new();
    for request in store.requests_for_quota(quota.id)? {
        requests.push(summary(store, &request)?);
    }
    Ok(Some(QuotaDetail {
        id: quota.id,
        user: quota.user,
        size: quota.size,
        used: store.quota_used(quota.id, now)?,
        email: quota.email,
        notes: quota.notes,
        requests,
    }))
}

/// Files matching a substring and a set of one-letter stage codes
/// (`UDTAR`, plus `X` for deleted rows). Unknown letters are ignored.
pub fn find_files(
    store: &Store,
    matching: &str,
    stage_letters: &str,
    resolver: Option<&PathResolver>,
) -> NlaResult<FileQuery> {
    let mut stages = Vec::new();
    for letter in stage_letters.chars() {
        if let Ok(stage) = Stage::from_letter(letter) {
            if !stages.contains(&stage) {
                stages.push(stage);
            }
        }
    }
    if stages.is_empty() {
        return Ok(FileQuery { count: 0, files: Vec::new() });
    }
    let files = store.files_matching(matching, &stages)?;
    let mut entries = Vec::new();
    for file in files {
        let spot_name = match resolver {
            Some(resolver) => match resolver.resolve_spot(&file.logical_path) {
                Ok((_, spot)) => Some(spot.to_string()),
                Err(err) => {
                    warn!("no spot for {}: {err}", file.logical_path);
                    None
                }
            },
            None => None,
        };
        entries.push(FileEntry {
            path: file.logical_path,
            spot_name,
            size: file.size,
            verified: file.verified,
            stage: file.stage.letter(),
        });
    }
    Ok(FileQuery {
        count: entries.len(),
        files: entries,
    })
}

/// The distinct spots that still contain UNVERIFIED files (plain-text
/// endpoint for the verification tooling).
pub fn unverified_spots(store: &Store, resolver: &PathResolver) -> NlaResult<Vec<String>> {
    let mut spots = BTreeSet::new();
    for file in store.files_in_stages(&[Stage::Unverified])? {
        if let Ok((_, spot)) = resolver.resolve_spot(&file.logical_path) {
            _ = spots.insert(spot.to_string());
        }
    }
    Ok(spots.into_iter().collect())
}

/// Per-stage file counts and sizes.
pub fn archive_status(store: &Store) -> NlaResult<Vec<StageStatus>> {
    let counts = store.stage_counts()?;
    Ok(ALL_STAGES
        .iter()
        .map(|stage| {
            let (count, bytes) = counts.get(&stage.code()).copied().unwrap_or_default();
            StageStatus {
                stage: stage.to_string(),
                letter: stage.letter(),
                count,
                bytes,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_with_quota() -> Store {
        let store = Store::open_in_memory().unwrap();
        _ = store
            .add_quota("fred", 100 << 30, Some("fred@example.ac.uk"), None)
            .unwrap();
        store
    }

    #[test]
    fn submit_enforces_the_quota() {
        let store = store_with_quota();
        let now = Utc::now();
        // 95 GiB already pinned by a live request
        let quota = store.quota_by_user("fred").unwrap().unwrap();
        let pinned = store
            .create_request(
                &NewRequest {
                    quota_id: quota.id,
                    retention: Some(now + chrono::Duration::days(5)),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        let big = store.insert_file("/badc/pinned.dat", 95 << 30, Stage::Restored).unwrap();
        store.add_files_to_request(pinned.id, &[big]).unwrap();

        _ = store.insert_file("/badc/f1.dat", 10 << 30, Stage::OnTape).unwrap();
        let submit = SubmitRequest {
            quota: "fred".into(),
            files: Some(vec!["/badc/f1.dat".into()]),
            ..Default::default()
        };
        let err = submit_request(&store, &submit, now).unwrap_err();
        assert!(err.to_string().contains("Requested file(s) exceed user's quota"));
        // no request was created
        assert_eq!(store.requests_by_date().unwrap().len(), 1);
    }

    #[test]
    fn submit_defaults_label_and_notify() {
        let store = store_with_quota();
        _ = store.insert_file("/badc/f1.dat", 1 << 20, Stage::OnTape).unwrap();
        let submit = SubmitRequest {
            quota: "fred".into(),
            files: Some(vec!["/badc/f1.dat".into()]),
            retention: Some("2026-12-01".into()),
            // empty string means "use the quota owner's address"
            notify_on_first_file: Some(String::new()),
            ..Default::default()
        };
        let id = submit_request(&store, &submit, Utc::now()).unwrap();
        let request = store.request_by_id(id).unwrap().unwrap();
        assert_eq!(request.label.as_deref(), Some("/badc/f1.dat"));
        assert_eq!(request.notify_first.as_deref(), Some("fred@example.ac.uk"));
        assert_eq!(request.notify_last, None);
        assert_eq!(request.retention.format("%Y-%m-%d").to_string(), "2026-12-01");
    }

    #[test]
    fn submit_rejects_unknown_users_and_empty_requests() {
        let store = store_with_quota();
        let submit = SubmitRequest { quota: "nobody".into(), ..Default::default() };
        assert!(submit_request(&store, &submit, Utc::now()).is_err());
        let submit = SubmitRequest { quota: "fred".into(), ..Default::default() };
        assert!(submit_request(&store, &submit, Utc::now()).is_err());
    }

    #[test]
    fn get_request_files_follow_the_priority_order() {
        let store = store_with_quota();
        let quota = store.quota_by_user("fred").unwrap().unwrap();
        let request = store
            .create_request(
                &NewRequest {
                    quota_id: quota.id,
                    request_files: vec!["/badc/requested.dat".into()],
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap();

        // nothing resolved yet: the requested paths are shown
        let detail = get_request(&store, request.id).unwrap().unwrap();
        assert_eq!(detail.files, vec!["/badc/requested.dat"]);

        // once resolved, the resolved set wins
        let file = store.insert_file("/badc/requested.dat", 1, Stage::OnTape).unwrap();
        store.add_files_to_request(request.id, &[file]).unwrap();
        let detail = get_request(&store, request.id).unwrap().unwrap();
        assert_eq!(detail.files, vec!["/badc/requested.dat"]);
        assert!(get_request(&store, 9999).unwrap().is_none());
    }

    #[test]
    fn find_files_filters_by_stage_letters() {
        let store = store_with_quota();
        _ = store.insert_file("/badc/t.dat", 1, Stage::OnTape).unwrap();
        _ = store.insert_file("/badc/r.dat", 2, Stage::Restored).unwrap();
        _ = store.insert_file("/neodc/t.dat", 3, Stage::OnTape).unwrap();

        let query = find_files(&store, "/badc/", "T", None).unwrap();
        assert_eq!(query.count, 1);
        assert_eq!(query.files[0].path, "/badc/t.dat");
        assert_eq!(query.files[0].stage, 'T');

        let query = find_files(&store, "", "TR", None).unwrap();
        assert_eq!(query.count, 3);
        // unknown letters are ignored
        let query = find_files(&store, "", "Zz", None).unwrap();
        assert_eq!(query.count, 0);
    }

    #[test]
    fn unverified_spots_deduplicates() {
        let store = store_with_quota();
        let resolver = PathResolver::from_tables(
            "spot-0001-cira /badc/cira\nspot-0003-faam /badc/faam\n",
            "/datacentre/archvol/pan52/archive/cira spot-0001-cira\n\
             /datacentre/archvol/pan23/archive/faam spot-0003-faam\n",
        )
        .unwrap();
        _ = store.insert_file("/badc/cira/a.dat", 1, Stage::Unverified).unwrap();
        _ = store.insert_file("/badc/cira/b.dat", 1, Stage::Unverified).unwrap();
        _ = store.insert_file("/badc/faam/c.dat", 1, Stage::Unverified).unwrap();
        _ = store.insert_file("/badc/faam/d.dat", 1, Stage::OnTape).unwrap();

        let spots = unverified_spots(&store, &resolver).unwrap();
        assert_eq!(spots, vec!["spot-0001-cira".to_string(), "spot-0003-faam".to_string()]);
    }

    #[test]
    fn archive_status_covers_every_stage() {
        let store = store_with_quota();
        _ = store.insert_file("/badc/t.dat", 10, Stage::OnTape).unwrap();
        _ = store.insert_file("/badc/u.dat", 5, Stage::Unverified).unwrap();
        let status = archive_status(&store).unwrap();
        assert_eq!(status.len(), ALL_STAGES.len());
        let on_tape = status.iter().find(|s| s.letter == 'T').unwrap();
        assert_eq!((on_tape.count, on_tape.bytes), (1, 10));
        let restored = status.iter().find(|s| s.letter == 'R').unwrap();
        assert_eq!((restored.count, restored.bytes), (0, 0));
    }
}
