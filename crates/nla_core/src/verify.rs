//! Verification: move newly ingested files from UNVERIFIED to ONDISK.
//!
//! A file is verified when it appears in one of its spot's checksum logs,
//! written by the external backup validation process. Every verified file is
//! added to a synthetic `_VERIFY` request whose retention (20 days, or "now"
//! on demand) is what later makes tidy move the file to ONTAPE. This is the
//! only producer of the UNVERIFIED → ONDISK → ONTAPE progression.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::{
    error::NlaResult,
    model::Stage,
    resolver::PathResolver,
    store::{NewRequest, Store},
    tape::{SpotCache, TapeClient, TAPED},
};

/// Retention given to the synthetic `_VERIFY` requests.
const VERIFY_RETENTION_DAYS: i64 = 20;

#[derive(Debug)]
pub struct VerifySettings {
    /// where the external process drops `<spot>.chksums.*` log files
    pub chksums_dir: PathBuf,
    /// restore-cache root the checksum logs address files under
    pub cache_prefix: String,
    /// logical-path prefixes eligible for quick verification
    pub quick_prefixes: Vec<String>,
    /// logical paths are used verbatim on the tape side
    pub test_mode: bool,
}

/// Accumulated result of one verification run. Missing and malformed logs
/// are reported, not fatal.
#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub verified: usize,
    pub not_found: usize,
    /// spots with no checksum log at all
    pub missing_log_spots: Vec<String>,
    /// log files containing lines without the two expected fields
    pub malformed_logs: Vec<PathBuf>,
    /// the synthetic request holding the newly verified files, if any
    pub request_id: Option<i64>,
}

/// Verify the UNVERIFIED backlog against the checksum logs.
pub fn verify(
    store: &Store,
    resolver: &PathResolver,
    settings: &VerifySettings,
    verify_now: bool,
) -> NlaResult<VerifyReport> {
    std::fs::create_dir_all(&settings.chksums_dir)?;

    let files = store.files_in_stages(&[Stage::Unverified])?;
    info!("number of UNVERIFIED files: {}", files.len());

    let now = Utc::now();
    let request = new_verify_request(store, now, verify_now, "FROM VERIFY PROCESS")?;
    let mut report = VerifyReport::default();
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let mut malformed: BTreeSet<PathBuf> = BTreeSet::new();
    let mut verified_paths = Vec::new();

    for file in files {
        let (prefix, spot_name) = match resolver.resolve_spot(&file.logical_path) {
            Ok(found) => found,
            Err(err) => {
                warn!("spot name not found for file {}: {err}", file.logical_path);
                continue;
            }
        };
        let remainder = &file.logical_path[prefix.len()..];
        // the logs address files below the restore cache or spot-relative
        let (to_find, to_find_rel) = if settings.test_mode {
            (file.logical_path.clone(), file.logical_path.clone())
        } else {
            (
                format!("{}/{spot_name}{remainder}", settings.cache_prefix),
                format!("{spot_name}{remainder}"),
            )
        };

        let pattern = settings
            .chksums_dir
            .join(format!("{spot_name}.chksums.*"))
            .to_string_lossy()
            .into_owned();
        let mut logs: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|err| {
                warn!("bad checksum glob {pattern}: {err}");
                err
            })
            .map(|paths| paths.filter_map(Result::ok).collect())
            .unwrap_or_default();
        if logs.is_empty() {
            _ = missing.insert(spot_name.to_string());
            continue;
        }
        // the verifier restarting leaves several logs per spot; trust the
        // most recent one that mentions the file
        logs.sort_unstable_by(|a, b| b.cmp(a));

        let mut found = false;
        'logs: for log in &logs {
            for line in BufReader::new(File::open(log)?).lines() {
                let line = line?;
                let mut fields = line.split_whitespace();
                let (Some(_checksum), Some(filename)) = (fields.next(), fields.next()) else {
                    if !line.trim().is_empty() {
                        _ = malformed.insert(log.clone());
                    }
                    continue;
                };
                if filename == to_find || filename == to_find_rel {
                    store.in_transaction(|store| {
                        store.set_file_stage_and_disk(file.id, Stage::OnDisk, None)?;
                        store.set_file_verified(file.id, Some(now))
                    })?;
                    verified_paths.push(file.logical_path.clone());
                    report.verified += 1;
                    found = true;
                    break 'logs;
                }
            }
        }
        if !found {
            report.not_found += 1;
        }
    }

    report.request_id = finish_verify_request(store, request, &verified_paths)?;
    report.missing_log_spots = missing.into_iter().collect();
    report.malformed_logs = malformed.into_iter().collect();
    Ok(report)
}

/// Quick verification for configured dataset prefixes: skip the checksum
/// comparison and only confirm the file is on tape (`sd_ls` status TAPED).
pub fn quick_verify(
    store: &Store,
    resolver: &PathResolver,
    settings: &VerifySettings,
    client: &TapeClient,
    verify_now: bool,
) -> NlaResult<VerifyReport> {
    let mut files = Vec::new();
    let mut seen = BTreeSet::new();
    for prefix in &settings.quick_prefixes {
        for file in store.files_matching(prefix, &[Stage::Unverified])? {
            if seen.insert(file.id) {
                files.push(file);
            }
        }
    }
    info!("number of UNVERIFIED files that can be quick verified: {}", files.len());

    let now = Utc::now();
    let request = new_verify_request(store, now, verify_now, "FROM QUICK_VERIFY PROCESS")?;
    let mut report = VerifyReport::default();
    let mut spots = SpotCache::new(client);
    let mut verified_paths = Vec::new();

    for file in files {
        let (_, spot_name) = match resolver.resolve_spot(&file.logical_path) {
            Ok(found) => found,
            Err(err) => {
                warn!("spot name not found for file {}: {err}", file.logical_path);
                continue;
            }
        };
        let spot_name = spot_name.to_string();
        let tape_side = resolver.tape_side_path(&file.logical_path, settings.test_mode)?;
        let basename = tape_side.rsplit('/').next().unwrap_or(&tape_side);
        let Some(entries) = spots.entries(&spot_name)? else {
            warn!("spot {spot_name} unknown to the tape system");
            continue;
        };
        let taped = entries.get(basename).is_some_and(|entry| entry.status == TAPED);
        if taped {
            store.in_transaction(|store| {
                store.set_file_stage_and_disk(file.id, Stage::OnDisk, None)?;
                store.set_file_verified(file.id, Some(now))
            })?;
            verified_paths.push(file.logical_path.clone());
            report.verified += 1;
        } else {
            report.not_found += 1;
        }
    }

    report.request_id = finish_verify_request(store, request, &verified_paths)?;
    Ok(report)
}

/// Create the synthetic request that gives verified files their implicit
/// retention.
fn new_verify_request(
    store: &Store,
    now: DateTime<Utc>,
    verify_now: bool,
    label: &str,
) -> NlaResult<i64> {
    let quota = store.ensure_verify_quota()?;
    let retention = if verify_now {
        now
    } else {
        now + Duration::days(VERIFY_RETENTION_DAYS)
    };
    let request = store.create_request(
        &NewRequest {
            label: Some(label.to_string()),
            quota_id: quota.id,
            retention: Some(retention),
            mark_complete_at: Some(now),
            ..Default::default()
        },
        now,
    )?;
    Ok(request.id)
}

/// Attach the verified paths to the synthetic request, or drop the request
/// when the run verified nothing.
fn finish_verify_request(
    store: &Store,
    request_id: i64,
    verified_paths: &[String],
) -> NlaResult<Option<i64>> {
    if verified_paths.is_empty() {
        store.delete_request(request_id)?;
        return Ok(None);
    }
    store.set_request_files_blob(request_id, verified_paths)?;
    Ok(Some(request_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VERIFY_USER;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const DOWNLOAD_CONF: &str = "spot-0001-cira /badc/cira\n";
    const SPOTLIST: &str = "/datacentre/archvol/pan52/archive/cira spot-0001-cira\n";

    fn setup() -> (TempDir, Store, PathResolver, VerifySettings) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let resolver = PathResolver::from_tables(DOWNLOAD_CONF, SPOTLIST).unwrap();
        let settings = VerifySettings {
            chksums_dir: tmp.path().join("chksums"),
            cache_prefix: "/datacentre/restorecache/archive".into(),
            quick_prefixes: vec![],
            test_mode: false,
        };
        (tmp, store, resolver, settings)
    }

    fn write_log(settings: &VerifySettings, name: &str, contents: &str) {
        std::fs::create_dir_all(&settings.chksums_dir).unwrap();
        std::fs::write(settings.chksums_dir.join(name), contents).unwrap();
    }

    #[test]
    fn checksum_match_promotes_to_ondisk() {
        let (_tmp, store, resolver, settings) = setup();
        let id = store.insert_file("/badc/cira/data/x.dat", 10, Stage::Unverified).unwrap();
        write_log(
            &settings,
            "spot-0001-cira.chksums.20160209",
            "d41d8cd9 /datacentre/restorecache/archive/spot-0001-cira/data/x.dat\n",
        );

        let report = verify(&store, &resolver, &settings, false).unwrap();
        assert_eq!(report.verified, 1);
        assert_eq!(report.not_found, 0);

        let file = store.file_by_id(id).unwrap().unwrap();
        assert_eq!(file.stage, Stage::OnDisk);
        assert!(file.verified.is_some());

        // the synthetic request carries the implicit retention
        let request = store.request_by_id(report.request_id.unwrap()).unwrap().unwrap();
        let quota = store.quota_by_id(request.quota_id).unwrap().unwrap();
        assert_eq!(quota.user, VERIFY_USER);
        assert_eq!(request.request_files, vec!["/badc/cira/data/x.dat"]);
        let days = (request.retention - request.request_date).num_days();
        assert_eq!(days, VERIFY_RETENTION_DAYS);
    }

    #[test]
    fn spot_relative_form_also_matches() {
        let (_tmp, store, resolver, settings) = setup();
        _ = store.insert_file("/badc/cira/data/y.dat", 10, Stage::Unverified).unwrap();
        write_log(
            &settings,
            "spot-0001-cira.chksums.20160209",
            "d41d8cd9 spot-0001-cira/data/y.dat\n",
        );
        let report = verify(&store, &resolver, &settings, false).unwrap();
        assert_eq!(report.verified, 1);
    }

    #[test]
    fn verify_now_sets_retention_to_now() {
        let (_tmp, store, resolver, settings) = setup();
        _ = store.insert_file("/badc/cira/data/x.dat", 10, Stage::Unverified).unwrap();
        write_log(
            &settings,
            "spot-0001-cira.chksums.20160209",
            "d41d8cd9 spot-0001-cira/data/x.dat\n",
        );
        let report = verify(&store, &resolver, &settings, true).unwrap();
        let request = store.request_by_id(report.request_id.unwrap()).unwrap().unwrap();
        assert!(request.retention <= Utc::now());
    }

    #[test]
    fn missing_and_malformed_logs_are_reported_not_fatal() {
        let (_tmp, store, resolver, settings) = setup();
        _ = store.insert_file("/badc/cira/data/x.dat", 10, Stage::Unverified).unwrap();

        // no log at all for the spot
        let report = verify(&store, &resolver, &settings, false).unwrap();
        assert_eq!(report.verified, 0);
        assert_eq!(report.missing_log_spots, vec!["spot-0001-cira".to_string()]);
        assert_eq!(report.request_id, None);

        // a malformed line is recorded, the good line still verifies
        write_log(
            &settings,
            "spot-0001-cira.chksums.20160209",
            "short-line\nd41d8cd9 spot-0001-cira/data/x.dat\n",
        );
        let report = verify(&store, &resolver, &settings, false).unwrap();
        assert_eq!(report.verified, 1);
        assert_eq!(report.malformed_logs.len(), 1);
    }

    #[test]
    fn empty_run_leaves_no_request_behind() {
        let (_tmp, store, resolver, settings) = setup();
        let report = verify(&store, &resolver, &settings, false).unwrap();
        assert_eq!(report.request_id, None);
        assert!(store.requests_by_date().unwrap().is_empty());
    }
}
