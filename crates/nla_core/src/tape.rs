//! Adapter around the external tape tools `sd_ls` and `sd_get`.
//!
//! `sd_ls` is run per spot and parsed into [`SpotEntry`]s; `sd_get` is
//! started as a child process whose progress log is the only completion
//! channel. The log is consumed line by line and turned into semantic
//! [`SavedFile`] events by [`parse_saved_line`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use log::debug;

use crate::error::{NlaError, NlaErrorKind, NlaResult, TapeErrorKind};

/// Tape status reported by `sd_ls` for files safely on tape.
pub const TAPED: &str = "TAPED";

/// One file of a spot as reported by `sd_ls`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpotEntry {
    /// tape-side path (column 11)
    pub path: String,
    /// file size in bytes (column 4)
    pub size: u64,
    /// tape status (column 3), expected [`TAPED`]
    pub status: String,
}

impl SpotEntry {
    /// The file name part of the tape-side path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Parse `sd_ls -L file` output. Lines that do not have the expected eleven
/// columns are skipped.
pub fn parse_listing(output: &str) -> Vec<SpotEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 11 {
            continue;
        }
        let Ok(size) = fields[3].parse::<u64>() else {
            continue;
        };
        entries.push(SpotEntry {
            path: fields[10].to_string(),
            size,
            status: fields[2].to_string(),
        });
    }
    entries
}

/// A file reported as restored by the retrieval log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedFile {
    /// the tape-side path the file was requested under
    pub archive_path: String,
    /// where the tape client wrote the payload
    pub local_path: String,
}

const SAVED_PREFIX: &str = "Saving ";
const SAVED_INFIX: &str = " into local file ";
const TEST_SAVED_PREFIX: &str = "Copying file: ";
const TEST_SAVED_INFIX: &str = " to ";

/// Parse one log line into a [`SavedFile`] event, if it reports a restore.
pub fn parse_saved_line(line: &str, test_mode: bool) -> Option<SavedFile> {
    let (prefix, infix) = if test_mode {
        (TEST_SAVED_PREFIX, TEST_SAVED_INFIX)
    } else {
        (SAVED_PREFIX, SAVED_INFIX)
    };
    let rest = line.trim_end().strip_prefix(prefix)?;
    let (archive_path, local_path) = rest.split_once(infix)?;
    if archive_path.is_empty() || local_path.is_empty() {
        return None;
    }
    Some(SavedFile {
        archive_path: archive_path.to_string(),
        local_path: local_path.to_string(),
    })
}

/// How to reach the tape tools.
#[derive(Clone, Debug)]
pub struct TapeClient {
    /// the `sd_get` executable (the emulator in test mode)
    pub sd_get: PathBuf,
    /// the `sd_ls` executable
    pub sd_ls: PathBuf,
    /// retrieval host passed to `sd_get -h`
    pub sd_host: String,
    /// tape-side paths mirror the archive namespace, log lines use the test format
    pub test_mode: bool,
}

impl TapeClient {
    /// List the files of a spot. A non-zero exit means the spot is unknown
    /// to the tape system.
    pub fn list_spot(&self, spot_name: &str) -> NlaResult<Vec<SpotEntry>> {
        let output = Command::new(&self.sd_ls)
            .args(["-s", spot_name, "-L", "file"])
            .output()
            .map_err(|err| TapeErrorKind::SpawnFailed {
                command: self.sd_ls.display().to_string(),
                source: err,
            })?;
        if !output.status.success() {
            return Err(TapeErrorKind::SpotUnknown(spot_name.to_string()).into());
        }
        let stdout = std::str::from_utf8(&output.stdout).map_err(|_| TapeErrorKind::OutputNotUtf8)?;
        Ok(parse_listing(stdout))
    }

    /// Start a retrieval: `sd_get -v -l <log> -h <host> -r <root> -f <listing>`.
    ///
    /// The child's exit code is not relied on; progress and completion are
    /// read from the log file.
    pub fn start_retrieval(&self, log: &Path, root: &Path, listing: &Path) -> NlaResult<Child> {
        debug!(
            "starting {} for listing {}",
            self.sd_get.display(),
            listing.display()
        );
        Command::new(&self.sd_get)
            .arg("-v")
            .arg("-l")
            .arg(log)
            .arg("-h")
            .arg(&self.sd_host)
            .arg("-r")
            .arg(root)
            .arg("-f")
            .arg(listing)
            .spawn()
            .map_err(|err| {
                TapeErrorKind::SpawnFailed {
                    command: self.sd_get.display().to_string(),
                    source: err,
                }
                .into()
            })
    }
}

/// Caches `sd_ls` listings per spot for the lifetime of one task.
///
/// Unknown spots are cached as `None` so they are only probed once.
#[derive(Debug)]
pub struct SpotCache<'a> {
    client: &'a TapeClient,
    listings: HashMap<String, Option<HashMap<String, SpotEntry>>>,
}

impl<'a> SpotCache<'a> {
    pub fn new(client: &'a TapeClient) -> Self {
        Self {
            client,
            listings: HashMap::new(),
        }
    }

    /// The spot's files keyed by basename, or `None` for an unknown spot.
    pub fn entries(&mut self, spot_name: &str) -> NlaResult<Option<&HashMap<String, SpotEntry>>> {
        if !self.listings.contains_key(spot_name) {
            let listing = match self.client.list_spot(spot_name) {
                Ok(entries) => Some(
                    entries
                        .into_iter()
                        .map(|entry| (entry.basename().to_string(), entry))
                        .collect(),
                ),
                Err(err) if is_spot_unknown(&err) => None,
                Err(err) => return Err(err),
            };
            _ = self.listings.insert(spot_name.to_string(), listing);
        }
        Ok(self.listings.get(spot_name).and_then(Option::as_ref))
    }
}

fn is_spot_unknown(err: &NlaError) -> bool {
    matches!(
        err.kind(),
        NlaErrorKind::Tape(TapeErrorKind::SpotUnknown(_))
    )
}

/// Incremental reader over the retrieval log.
///
/// The log appears some time after the child starts; until then polls return
/// no lines. Offsets persist across polls so every line is seen once.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    reader: Option<BufReader<File>>,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
        }
    }

    /// Whether the log file has appeared yet.
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Read all complete lines appended since the last poll.
    pub fn poll(&mut self) -> std::io::Result<Vec<String>> {
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.reader = Some(BufReader::new(file)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => return Err(err),
            }
        }
        let mut lines = Vec::new();
        if let Some(reader) = self.reader.as_mut() {
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 {
                    break;
                }
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn listing_parses_eleven_column_lines() {
        let output = "\
20481 spot-0001-cira TAPED 1073741824 0 badc badc 2016-02-09 10:00 vol1 /archive/spot-0001-cira/data/x.dat
garbage line
20482 spot-0001-cira SYNCED 52428800 0 badc badc 2016-02-09 10:00 vol1 /archive/spot-0001-cira/data/y.dat
";
        // columns: 3 = status, 4 = size, 11 = path
        let entries = parse_listing(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size, 1_073_741_824);
        assert_eq!(entries[0].status, TAPED);
        assert_eq!(entries[0].path, "/archive/spot-0001-cira/data/x.dat");
        assert_eq!(entries[0].basename(), "x.dat");
        assert_eq!(entries[1].status, "SYNCED");
    }

    #[rstest::rstest]
    #[case(
        "Saving /archive/spot-0001-cira/data/x.dat into local file /restore_1/archive/spot-0001-cira/data/x.dat\n",
        false,
        Some(("/archive/spot-0001-cira/data/x.dat", "/restore_1/archive/spot-0001-cira/data/x.dat"))
    )]
    #[case("Copying file: /badc/cira/data/x.dat to /restore_1/x.dat", true, Some(("/badc/cira/data/x.dat", "/restore_1/x.dat")))]
    #[case("Transfer starting", false, None)]
    #[case("Saving  into local file ", false, None)]
    // production lines must not parse in test mode and vice versa
    #[case("Saving /a into local file /b", true, None)]
    #[case("Copying file: /a to /b", false, None)]
    fn saved_line_parsing(
        #[case] line: &str,
        #[case] test_mode: bool,
        #[case] expected: Option<(&str, &str)>,
    ) {
        let saved = parse_saved_line(line, test_mode);
        let expected = expected.map(|(archive_path, local_path)| SavedFile {
            archive_path: archive_path.to_string(),
            local_path: local_path.to_string(),
        });
        assert_eq!(saved, expected);
    }

    #[test]
    fn log_tail_sees_every_line_once() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("retrieve_log_1.txt");
        let mut tail = LogTail::new(&log_path);

        // log not there yet
        assert!(tail.poll().unwrap().is_empty());
        assert!(!tail.is_open());

        let mut log = File::create(&log_path).unwrap();
        writeln!(log, "line one").unwrap();
        log.flush().unwrap();
        assert_eq!(tail.poll().unwrap(), vec!["line one\n".to_string()]);

        writeln!(log, "line two").unwrap();
        log.flush().unwrap();
        assert_eq!(tail.poll().unwrap(), vec!["line two\n".to_string()]);
        assert!(tail.poll().unwrap().is_empty());
    }
}
