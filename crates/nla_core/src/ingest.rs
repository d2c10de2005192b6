//! Ingestion: register files from tape-only filesets with the archive.
//!
//! Walks every fileset the archive app marks "primary on tape" and adds
//! each sufficiently large real file at stage UNVERIFIED, where the
//! verifier picks it up.

use std::path::Path;

use log::{debug, info, warn};

use crate::{
    error::{NlaResult, TapeErrorKind},
    store::Store,
};

#[derive(Clone, Debug)]
pub struct IngestSettings {
    /// endpoint listing the filesets whose primary copy is tape
    pub on_tape_url: String,
    /// files smaller than this are not worth a tape round-trip
    pub min_file_size: u64,
}

/// What one ingestion run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub added: usize,
    pub skipped_links: usize,
    pub skipped_small: usize,
}

/// Fetch the primary-on-tape fileset list and register their files.
pub fn move_files_to_nla(store: &Store, settings: &IngestSettings) -> NlaResult<IngestOutcome> {
    let filesets = fetch_on_tape_filesets(&settings.on_tape_url)?;
    let mut outcome = IngestOutcome::default();
    for fileset in filesets {
        info!("scanning fileset {fileset}");
        ingest_fileset(store, Path::new(&fileset), settings.min_file_size, &mut outcome)?;
    }
    Ok(outcome)
}

/// Walk one fileset; links never ingest and per-file faults only skip the file.
pub fn ingest_fileset(
    store: &Store,
    fileset: &Path,
    min_file_size: u64,
    outcome: &mut IngestOutcome,
) -> NlaResult<()> {
    for entry in walkdir::WalkDir::new(fileset)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path_is_symlink() {
            debug!("ignore link: {}", entry.path().display());
            outcome.skipped_links += 1;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!("could not add {}: {err}", entry.path().display());
                continue;
            }
        };
        if size < min_file_size {
            debug!("ignore small: {}", entry.path().display());
            outcome.skipped_small += 1;
            continue;
        }
        if store.add_file(&entry.path().to_string_lossy(), size)? {
            info!("adding {}", entry.path().display());
            outcome.added += 1;
        }
    }
    Ok(())
}

/// Fetch and parse the primary-on-tape endpoint.
pub fn fetch_on_tape_filesets(url: &str) -> NlaResult<Vec<String>> {
    let response = reqwest::blocking::get(url).map_err(TapeErrorKind::FromReqwestError)?;
    if !response.status().is_success() {
        return Err(TapeErrorKind::FetchFailed {
            url: url.to_string(),
            status: response.status().as_u16(),
        }
        .into());
    }
    let body = response.text().map_err(TapeErrorKind::FromReqwestError)?;
    Ok(parse_on_tape_listing(&body))
}

/// One fileset per line; the logical path is the third column.
pub fn parse_on_tape_listing(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn ingest_skips_links_and_small_files() {
        let tmp = TempDir::new().unwrap();
        let fileset = tmp.path().join("badc/cira");
        std::fs::create_dir_all(fileset.join("data")).unwrap();
        std::fs::write(fileset.join("data/big.dat"), vec![0u8; 2048]).unwrap();
        std::fs::write(fileset.join("data/small.dat"), vec![0u8; 16]).unwrap();
        std::os::unix::fs::symlink(fileset.join("data/big.dat"), fileset.join("data/link.dat"))
            .unwrap();

        let store = Store::open_in_memory().unwrap();
        let mut outcome = IngestOutcome::default();
        ingest_fileset(&store, &fileset, 1024, &mut outcome).unwrap();
        assert_eq!(outcome, IngestOutcome { added: 1, skipped_links: 1, skipped_small: 1 });

        let file = store
            .file_by_path(&fileset.join("data/big.dat").to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(file.stage, Stage::Unverified);
        assert_eq!(file.size, 2048);

        // a second run adds nothing new
        let mut outcome = IngestOutcome::default();
        ingest_fileset(&store, &fileset, 1024, &mut outcome).unwrap();
        assert_eq!(outcome.added, 0);
    }

    #[test]
    fn on_tape_listing_takes_the_third_column() {
        let body = "1 2 /badc/cira extra\nshort line\n3 4 /badc/faam\n";
        // "short line" has only two columns and is dropped
        assert_eq!(parse_on_tape_listing(body), vec!["/badc/cira", "/badc/faam"]);
    }
}
